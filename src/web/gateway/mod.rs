//! Gateway side: per-request routing onto workers, plus edge concerns.

pub mod auth;
pub mod router;

pub use router::{GatewayRouter, LeasedBody, ProxyRequest};
