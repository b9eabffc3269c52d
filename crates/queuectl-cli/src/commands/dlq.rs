use std::path::Path;
use std::process::ExitCode;

use queuectl_core::domain::JobId;

use super::{open, print_json};

pub async fn list(home: &Path) -> anyhow::Result<ExitCode> {
    let dead = open(home)?.dlq_list().await?;
    print_json(&dead)?;
    Ok(ExitCode::SUCCESS)
}

pub async fn retry(home: &Path, id: &str) -> anyhow::Result<ExitCode> {
    let revived = match id.parse::<JobId>() {
        Ok(id) => open(home)?.dlq_retry(id).await?,
        Err(_) => false,
    };

    if revived {
        println!("enqueued");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("not-found");
        Ok(ExitCode::FAILURE)
    }
}
