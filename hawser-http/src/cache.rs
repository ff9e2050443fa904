//! External response cache contract.
//!
//! The engine consults a cache through this interface; persistence is the
//! implementation's business. Responses offered to the cache have their
//! bodies stripped -- body bytes arrive through the [`CacheRequest`] sink
//! as the application reads them.

use std::io::Write;

use crate::cache_strategy::CacheStrategy;
use crate::request::Request;
use crate::response::Response;

/// Extension header recording when the cached request was first sent.
pub const SENT_MILLIS: &str = "X-Hawser-Sent-Millis";

/// Extension header recording when the cached response was first received.
pub const RECEIVED_MILLIS: &str = "X-Hawser-Received-Millis";

/// An in-progress cache insertion. The engine tees response bytes into
/// [`body`](CacheRequest::body) as the application consumes them, and
/// calls [`abort`](CacheRequest::abort) if the stream fails before EOF.
pub trait CacheRequest: Send {
    /// The sink for body bytes, or `None` if the cache declined the body.
    fn body(&mut self) -> Option<&mut (dyn Write + Send)>;

    /// Abandon this insertion; partial data must not be served later.
    fn abort(&mut self);
}

/// A response cache.
pub trait HttpCache: Send + Sync {
    /// The stored response for `request`, if any. Returned bodies are
    /// replayed to the engine, so they must be freshly readable.
    fn get(&self, request: &Request) -> Option<Response>;

    /// Offer a response for storage. Return `None` to decline, or a
    /// [`CacheRequest`] to receive the body bytes.
    fn put(&self, response: &Response) -> Option<Box<dyn CacheRequest>>;

    /// Drop any entry for `request`. Called when a non-GET exchange
    /// invalidates the URL.
    fn remove(&self, request: &Request);

    /// Replace the headers of `cached` with those of `fresh` after a
    /// successful revalidation.
    fn update(&self, cached: &Response, fresh: &Response);

    /// Observe the strategy chosen for a request, for hit-rate tracking.
    fn track_response(&self, strategy: &CacheStrategy);

    /// Observe a conditional request answered with 304 Not Modified.
    fn track_conditional_hit(&self);
}
