use std::path::Path;
use std::process::ExitCode;

use super::open;

pub async fn get(home: &Path, key: &str) -> anyhow::Result<ExitCode> {
    match open(home)?.config_get(key).await? {
        Some(value) => {
            println!("{value}");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("not-found");
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn set(home: &Path, key: &str, value: &str) -> anyhow::Result<ExitCode> {
    open(home)?.config_set(key, value).await?;
    println!("ok");
    Ok(ExitCode::SUCCESS)
}
