//! Governed client facade.
//!
//! The public surface is small: build a [`GovernedClient`] around a
//! [`TextGenerator`] and call [`GovernedClient::generate`]. Waiting, quota
//! accounting, caching and retries all happen inside.

pub mod builder;
pub mod core;
pub mod generator;
pub mod policy;
pub mod request;

pub use builder::GovernedClientBuilder;
pub use self::core::{CallStats, GovernedClient};
pub use generator::{GenerationConfig, TextGenerator};
pub use policy::{Decision, RetryPolicy};
pub use request::GenerateRequest;
