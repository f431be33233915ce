//! Client for the LLM server exposed through a tunnel

pub mod client;
pub mod types;

pub use client::LlmClient;
pub use types::{ChatMessage, ChatReply, ChatUsage, MessageRole};
