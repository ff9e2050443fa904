//! Client metrics, exposed through the metriken registry.

use metriken::{metric, Counter, Gauge};

#[metric(name = "hawser/calls/started", description = "Calls begun, sync and async")]
pub static CALLS_STARTED: Counter = Counter::new();

#[metric(name = "hawser/calls/canceled", description = "Calls canceled before completion")]
pub static CALLS_CANCELED: Counter = Counter::new();

#[metric(
    name = "hawser/dispatcher/running",
    description = "Async calls currently executing"
)]
pub static DISPATCHER_RUNNING: Gauge = Gauge::new();

#[metric(name = "hawser/cache/hits", description = "Responses served from cache")]
pub static CACHE_HITS: Counter = Counter::new();

#[metric(
    name = "hawser/cache/conditional_hits",
    description = "Conditional requests answered 304"
)]
pub static CACHE_CONDITIONAL_HITS: Counter = Counter::new();

#[metric(
    name = "hawser/connections/created",
    description = "Sockets opened to origins and proxies"
)]
pub static CONNECTIONS_CREATED: Counter = Counter::new();

#[metric(
    name = "hawser/connections/reused",
    description = "Exchanges served on a pooled connection"
)]
pub static CONNECTIONS_REUSED: Counter = Counter::new();

#[metric(name = "hawser/routes/failed", description = "Route connect failures")]
pub static ROUTES_FAILED: Counter = Counter::new();

#[metric(
    name = "hawser/responses/gunzipped",
    description = "Response bodies transparently gunzipped"
)]
pub static RESPONSES_GUNZIPPED: Counter = Counter::new();
