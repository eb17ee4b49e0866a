//! Concrete LLM providers.

pub mod openrouter;

pub use openrouter::OpenRouterProvider;
