mod app;
mod routes;

pub mod config;
pub mod model_handler;
pub mod model_service;
pub mod ort_service;
pub mod preprocessing;
pub mod server;
pub mod state;
pub mod telemetry;

pub use app::start_app;
pub use routes::ApiError;
