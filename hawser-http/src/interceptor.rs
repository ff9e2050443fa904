//! Network interceptors.
//!
//! Interceptors observe and rewrite the exact request that goes on the
//! wire and the exact response that comes back, after the cache and the
//! connection have been prepared. Each interceptor must call
//! [`Chain::proceed`] exactly once and must not move the exchange to a
//! different host or port: the connection is already established.

use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;

/// One link of the interceptor pipeline.
pub trait Chain {
    /// The request as it stands at this link.
    fn request(&self) -> &Request;

    /// Hand `request` to the rest of the pipeline and return its
    /// response. Must be called exactly once per intercept invocation.
    fn proceed(&mut self, request: Request) -> Result<Response, HttpError>;
}

/// Observes and optionally rewrites one network exchange.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut dyn Chain) -> Result<Response, HttpError>;
}
