pub mod bridge;
pub mod cli;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod utils;

pub use cluster::ConnectionManager;
pub use engine::{LoadGenerator, WorkerContext};
