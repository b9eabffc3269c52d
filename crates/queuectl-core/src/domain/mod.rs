//! Domain model (IDs, states, payloads, records, outcomes, decisions).
//!
//! Nothing here touches the database or spawns processes.

pub mod decision;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod payload;
pub mod state;

pub use decision::{Decider, Decision, DefaultDecider};
pub use ids::{JobId, ParseIdError, WorkerId};
pub use job::{JobFilter, JobRecord};
pub use outcome::{ExecutionOutcome, OutcomeKind};
pub use payload::{EnqueueRequest, JobPayload, PayloadError, StructuredJob};
pub use state::{JobState, ParseStateError};
