pub mod chain;
pub mod config;

pub use chain::{ChainRequest, DoneEvent, FilterType, ImageStatus};
pub use config::Config;
