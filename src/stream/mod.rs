// Input stream — newline-delimited JSON envelopes, read in batches.

pub mod batcher;
pub mod envelope;

pub use batcher::{open_input, InputReader, StreamBatcher};
pub use envelope::{Envelope, RawPost, Record, ValidationError};
