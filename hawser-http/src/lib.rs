//! HTTP client request execution engine.
//!
//! Given a user request, the engine produces a response by orchestrating
//! route selection across proxies and resolved addresses, connection
//! acquisition from a pool, cache lookup and revalidation, the network
//! exchange itself, transparent gzip decoding, follow-ups for redirects
//! and authentication, and concurrent dispatch under global and per-host
//! caps.
//!
//! # Architecture
//!
//! ```text
//!   Call ──▶ Dispatcher ──▶ Engine ──▶ CacheStrategy
//!                             │
//!                  RouteSelector ──▶ ConnectionPool ──▶ Connection
//!                             │
//!                         Transport (http1 built in, h2 pluggable)
//! ```
//!
//! A [`Call`] drives one request through up to twenty follow-ups; the
//! [`Dispatcher`] schedules asynchronous calls on a grow-on-demand thread
//! pool. Blocking sockets carry the exchange; DNS, proxy selection,
//! cookies, caching, and authentication are all injected contracts.
//!
//! # Example
//!
//! ```rust,ignore
//! use hawser_http::{HttpClient, Request};
//!
//! let client = HttpClient::new();
//! let request = Request::get("http://example.com/")?;
//! let mut response = client.new_call(request).execute()?;
//! assert_eq!(response.code(), 200);
//! let body = response.take_body().unwrap().string()?;
//! ```

pub mod address;
pub mod auth;
pub mod body;
pub mod cache;
pub mod cache_control;
pub mod cache_strategy;
mod call;
mod client;
pub mod connection;
mod dispatcher;
mod engine;
pub mod error;
pub mod headers;
mod http1;
mod interceptor;
pub mod metrics;
mod pool;
pub mod request;
pub mod response;
pub mod route;
pub mod tls;
pub mod transport;

pub use address::{Address, CookieJar, Dns, NoProxy, Proxy, ProxySelector, SystemDns};
pub use auth::{basic_credentials, Authenticator, BasicAuthenticator, Challenge, NoAuthenticator};
pub use body::{Body, ResponseBody, RetryableSink};
pub use cache::{CacheRequest, HttpCache};
pub use cache_control::CacheControl;
pub use cache_strategy::CacheStrategy;
pub use call::Call;
pub use client::{HttpClient, HttpClientBuilder};
pub use connection::{Connection, Protocol};
pub use dispatcher::Dispatcher;
pub use error::HttpError;
pub use headers::{Headers, HeadersBuilder};
pub use http1::Http1Transport;
pub use interceptor::{Chain, Interceptor};
pub use pool::{ConnectionPool, PoolConfig};
pub use request::{Request, RequestBuilder};
pub use response::{Handshake, Response, ResponseBuilder};
pub use route::{Route, RouteDatabase, RouteSelector};
pub use tls::CertificatePinner;
pub use transport::{Transport, TransportFactory, DISCARD_STREAM_TIMEOUT_MILLIS};
