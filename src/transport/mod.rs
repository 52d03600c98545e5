//! HTTP transport for the upstream generative-text service.

pub mod http;

pub use http::HttpTextGenerator;
