pub mod cycle;

pub use cycle::{CycleStats, NewsAggregator};
