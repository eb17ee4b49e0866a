//! LLM integration for docforge.
//!
//! Provides the chat-completion types shared by generation backends and
//! evaluation judges, the [`LlmProvider`] trait, an OpenRouter provider with
//! full-jitter transport retry, and per-model pricing for cost estimates.
//!
//! ```ignore
//! use docforge::llm::{GenerationRequest, LlmProvider, Message, OpenRouterProvider};
//!
//! let provider = OpenRouterProvider::from_env()?;
//! let request = GenerationRequest::new(
//!     "anthropic/claude-sonnet-4",
//!     vec![Message::user("Summarise this document")],
//! );
//! let response = provider.generate(request).await?;
//! ```

pub mod cost;
pub mod providers;
pub mod types;

pub use cost::{ModelPricing, PricingTable};
pub use providers::OpenRouterProvider;
pub use types::{
    Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage,
};
