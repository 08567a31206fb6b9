pub mod collector;
pub mod config;
pub mod errors;
pub mod mapper;
pub mod metrics;
pub mod model;
pub mod oauth;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod token;
