// Scoring — how much weight a post carries in the sentiment series.

pub mod impact;
