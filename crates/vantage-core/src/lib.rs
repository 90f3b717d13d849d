pub mod api;
pub mod cache;
pub mod config;
pub mod driver;
pub mod errors;
pub mod model;
pub mod mutate;
pub mod orchestrator;
pub mod progress;
pub mod resume;
pub mod session;
pub mod stream;
