pub mod batch;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod logging;
pub mod normalization;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod schema;
pub mod store;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use batch::{Batch, RawRow, Value};
pub use config::IngestConfig;
pub use error::{IngestError, Phase, StoreError};
pub use orchestrator::{BatchSummary, Orchestrator};
pub use plan::IngestPlan;
