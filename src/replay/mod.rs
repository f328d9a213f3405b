//! Replay of captured writes onto the instance that missed them.

pub mod backoff;
pub mod delete;
pub mod engine;
pub mod translate;

pub use backoff::RetryPolicy;
pub use delete::DeletionConverter;
pub use engine::{ReplayEngine, ReplayOutcome, ReplayStatsSnapshot};
pub use translate::{Resolution, Translator};
