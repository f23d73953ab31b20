//! Wire layer for the OpenAI-compatible gateway

pub mod openai;
pub mod sse;
pub mod transport;

// Re-export for convenience
pub use transport::{
  ByteStream, HttpTransport, RawResponse, RawStream, Transport,
};
