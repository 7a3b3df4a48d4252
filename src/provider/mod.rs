pub mod client;
pub mod error;
pub mod sse;
pub mod types;

pub use client::ProviderClient;
pub use error::ProviderError;
pub use types::{ChatMessageResponse, ChatRequest, StreamEvent};
