// Gateway and worker manager for the Voice Insight STT/TTS workers

pub mod error;
pub mod gateway;
pub mod logger;
pub mod models;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod server;
pub mod worker;

pub use error::OrchestratorError;
