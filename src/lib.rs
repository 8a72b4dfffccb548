pub mod config;
pub mod editing;
pub mod errors;
pub mod telemetry;
