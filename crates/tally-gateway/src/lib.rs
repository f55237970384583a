//! HTTP implementation of the reporting gateway.

pub mod http;
pub mod wire;

pub use http::HttpGateway;
