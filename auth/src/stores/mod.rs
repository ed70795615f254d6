//! Storage implementations for login sessions.
//!
//! - **Session Store** (Redis) - ephemeral session storage with TTL

pub mod session_redis;

// Re-exports
pub use session_redis::RedisSessionStore;
