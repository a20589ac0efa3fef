//! pixelchain: image filter stages chained over a message broker.
//! Each former component lives as a local module under `src/`.

pub mod prelude;

#[path = "common/lib.rs"]
pub mod common;
#[path = "engine/lib.rs"]
pub mod engine;
#[path = "errors/lib.rs"]
pub mod errors;
#[path = "imaging/lib.rs"]
pub mod imaging;
#[path = "ledger/lib.rs"]
pub mod ledger;
#[path = "queue/lib.rs"]
pub mod queue;
#[path = "resilience/lib.rs"]
pub mod resilience;
#[path = "storage/lib.rs"]
pub mod storage;
#[path = "utils/lib.rs"]
pub mod utils;
