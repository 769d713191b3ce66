// Pipeline — the long-running roles and the persistence step they share.
//
// ingest:    stream batch -> store -> engine cycle
// filter:    raw stream -> classifier requests on stdout
// aggregate: engine cycle on a fixed interval

pub mod filter;
pub mod ingest;
pub mod persist;
pub mod refresh;

pub use persist::{persist_impacts, persist_samples, PersistReport};
pub use refresh::{AggregateTask, CycleReport, SentimentEngine};
