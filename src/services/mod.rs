//! Service layer modules for external integrations.
//!
//! Contains the collaborator traits the pipeline depends on, the AI service
//! adapters implementing them, and the Redis estimate cache.

pub mod ai_client;
pub mod cache;
pub mod traits;

pub use ai_client::AiClient;
pub use cache::RedisCache;
pub use traits::*;
