pub mod cli;
pub mod config;
pub mod consumers;
pub mod control;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod transport;
