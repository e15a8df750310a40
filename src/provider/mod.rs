mod types;

pub mod bridge;
#[cfg(feature = "google")]
pub mod google;
pub mod ndjson;
pub mod ollama;

pub use types::{ChatChunk, GenerateFuture, GenerationStream, Producer, Provider, StreamState};
