// Bullbear: incremental market-sentiment aggregation over social media streams
//
// This is the library root. Each module corresponds to a major subsystem
// of the ingest → impact refresh → aggregation pipeline.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod db;
pub mod pipeline;
pub mod scheduler;
pub mod scoring;
pub mod status;
pub mod stream;
pub mod tunnel;
