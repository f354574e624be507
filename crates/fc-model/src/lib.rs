//! The rate-limited model client and its provider abstraction.
//!
//! Providers implement a narrow streaming chat contract; the client wraps a
//! provider with a FIFO queue, a concurrency cap, RPM/TPM token buckets, and
//! retry with exponential backoff. Retries live here and nowhere else.

pub mod client;
pub mod limiter;
pub mod provider;

pub use client::RateLimitedClient;
pub use provider::{
    ChatMessage, ChatOptions, ChatProvider, ChatRole, ChatStream, MockChatProvider, ModelError,
    StreamEvent, Usage,
};
