//! Batch orchestration for lorabatch.
//!
//! Runs the external training process once per work unit, watches its output,
//! retries once after a GPU out-of-memory failure and ships finished LoRA
//! files to remote storage.

pub mod batch;
pub mod error;
pub mod launch;
pub mod runner;
pub mod stream;

pub use batch::{BatchDriver, BatchOptions, BatchReport};
pub use error::{OrchestrationError, Result};
pub use launch::LaunchCommand;
pub use runner::{JobReport, JobRunner, RecoveryPolicy};
pub use stream::{CommandRunner, LineRenderer, RunOutcome, StreamMultiplexer};
