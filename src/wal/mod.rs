//! Write Log Module
//!
//! Durable record of writes accepted by one instance that still have to
//! be replayed on the other.

pub mod entry;
mod store;

pub use entry::{ConversionType, EntrySummary, Instance, Method, NewWrite, WriteLogEntry, WriteStatus};
pub use store::{StatusCounts, WriteLogStore};
