pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod ingest;
pub mod metrics_consts;
pub mod store;

pub use config::Config;
pub use error::StartupError;
