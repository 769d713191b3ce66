// Windowed sentiment aggregation — per-source series and the ensembles
// built from them.

pub mod ensemble;
pub mod window;

pub use ensemble::{compute_cycle, NormalizationPolicy};
pub use window::{weighted_sentiment, Normalization, Window};
