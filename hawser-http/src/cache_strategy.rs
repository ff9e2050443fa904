//! Cache strategy: given a request and a cached response, decide whether
//! to use the network, the cache, or both.
//!
//! Selecting a strategy may add conditions to the request (such as
//! `If-Modified-Since` for a conditional GET) or warnings to the cached
//! response (if the cached data is potentially stale). Freshness follows
//! RFC 7234.

use std::time::SystemTime;

use crate::cache;
use crate::request::Request;
use crate::response::Response;

const ONE_DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The outcome of cache strategy selection.
///
/// Four shapes: `(Some, None)` network only; `(None, Some)` serve from
/// cache; `(Some, Some)` conditional revalidation; `(None, None)` the
/// request forbade the network (`only-if-cached`) and the cache cannot
/// satisfy it -- the engine synthesizes a 504.
#[derive(Debug)]
pub struct CacheStrategy {
    /// The request to send on the network, or `None` to skip the network.
    pub network_request: Option<Request>,
    /// The cached response to return or validate, or `None`.
    pub cache_response: Option<Response>,
}

impl CacheStrategy {
    /// True if `response` may be stored to later serve another request.
    pub fn is_cacheable(response: &Response, request: &Request) -> bool {
        // Uncacheable response codes always go to the network
        // (RFC 7231 Section 6.1). Partial content is not cached.
        match response.code() {
            200 | 203 | 204 | 300 | 301 | 404 | 405 | 410 | 414 | 501 | 308 => {}

            302 | 307 => {
                // Cacheable only with explicit freshness or visibility.
                // s-maxage is ignored: this is a private cache.
                let cc = response.cache_control();
                if response.header("Expires").is_none()
                    && cc.max_age_seconds.is_none()
                    && !cc.public
                    && !cc.private
                {
                    return false;
                }
            }

            _ => return false,
        }

        !response.cache_control().no_store && !request.cache_control().no_store
    }
}

/// Computes a [`CacheStrategy`] for a fixed `now`.
pub struct Factory<'a> {
    now_millis: i64,
    request: &'a Request,
    cache_response: Option<Response>,

    /// The server's time when the cached response was served, if known.
    served_date: Option<i64>,
    served_date_string: Option<String>,
    /// The last modified date of the cached response, if known.
    last_modified: Option<i64>,
    last_modified_string: Option<String>,
    /// The expiration date of the cached response. `max-age` wins over
    /// this when both are present.
    expires: Option<i64>,
    /// When the cached request was first initiated.
    sent_request_millis: i64,
    /// When the cached response was first received.
    received_response_millis: i64,
    etag: Option<String>,
    age_seconds: Option<u64>,
}

impl<'a> Factory<'a> {
    pub fn new(now_millis: i64, request: &'a Request, cache_response: Option<Response>) -> Self {
        let mut factory = Factory {
            now_millis,
            request,
            cache_response: None,
            served_date: None,
            served_date_string: None,
            last_modified: None,
            last_modified_string: None,
            expires: None,
            sent_request_millis: 0,
            received_response_millis: 0,
            etag: None,
            age_seconds: None,
        };

        if let Some(cached) = &cache_response {
            factory.sent_request_millis = cached.sent_request_at_millis();
            factory.received_response_millis = cached.received_response_at_millis();
            for (name, value) in cached.headers().iter() {
                if name.eq_ignore_ascii_case("Date") {
                    factory.served_date = parse_date_millis(value);
                    factory.served_date_string = Some(value.to_string());
                } else if name.eq_ignore_ascii_case("Expires") {
                    factory.expires = parse_date_millis(value);
                } else if name.eq_ignore_ascii_case("Last-Modified") {
                    factory.last_modified = parse_date_millis(value);
                    factory.last_modified_string = Some(value.to_string());
                } else if name.eq_ignore_ascii_case("ETag") {
                    factory.etag = Some(value.to_string());
                } else if name.eq_ignore_ascii_case("Age") {
                    factory.age_seconds = value.trim().parse().ok();
                } else if name.eq_ignore_ascii_case(cache::SENT_MILLIS) {
                    factory.sent_request_millis = value.parse().unwrap_or(0);
                } else if name.eq_ignore_ascii_case(cache::RECEIVED_MILLIS) {
                    factory.received_response_millis = value.parse().unwrap_or(0);
                }
            }
        }
        factory.cache_response = cache_response;
        factory
    }

    /// Select the strategy to satisfy the request with the cached
    /// response, if any.
    pub fn get(self) -> CacheStrategy {
        let only_if_cached = self.request.cache_control().only_if_cached;
        let candidate = self.get_candidate();

        if candidate.network_request.is_some() && only_if_cached {
            // The network is forbidden and the cache is insufficient.
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }

        candidate
    }

    /// The strategy to use assuming the request may use the network.
    fn get_candidate(mut self) -> CacheStrategy {
        let cached = match self.cache_response.take() {
            Some(cached) => cached,
            None => return self.network_only(),
        };

        // Drop the cached response if it is missing a required handshake.
        if self.request.is_https() && cached.handshake().is_none() {
            return self.network_only();
        }

        // If this response should never have been stored, never serve it.
        // Redundant as long as the persistence store is well behaved.
        if !CacheStrategy::is_cacheable(&cached, self.request) {
            return self.network_only();
        }

        let request_caching = self.request.cache_control();
        if request_caching.no_cache || has_conditions(self.request) {
            return self.network_only();
        }

        let age_millis = self.cache_response_age();
        let mut fresh_millis = self.compute_freshness_lifetime(&cached);

        if let Some(max_age) = request_caching.max_age_seconds {
            fresh_millis = fresh_millis.min(seconds_to_millis(max_age));
        }

        let min_fresh_millis = request_caching
            .min_fresh_seconds
            .map_or(0, seconds_to_millis);

        let response_caching = cached.cache_control();
        let mut max_stale_millis = 0;
        if !response_caching.must_revalidate {
            if let Some(max_stale) = request_caching.max_stale_seconds {
                max_stale_millis = seconds_to_millis(max_stale);
            }
        }

        if !response_caching.no_cache
            && age_millis + min_fresh_millis < fresh_millis.saturating_add(max_stale_millis)
        {
            let mut builder = cached.into_builder();
            if age_millis + min_fresh_millis >= fresh_millis {
                builder = builder.add_header("Warning", "110 hawser \"Response is stale\"");
            }
            if age_millis > ONE_DAY_MILLIS && self.is_freshness_lifetime_heuristic(&response_caching)
            {
                builder = builder.add_header("Warning", "113 hawser \"Heuristic expiration\"");
            }
            return CacheStrategy {
                network_request: None,
                cache_response: Some(builder.build()),
            };
        }

        // Build a conditional request with the best available validator.
        let mut builder = self.request.new_builder();
        if let Some(etag) = &self.etag {
            builder = builder.header("If-None-Match", etag);
        } else if let Some(last_modified) = &self.last_modified_string {
            builder = builder.header("If-Modified-Since", last_modified);
        } else if let Some(served) = &self.served_date_string {
            builder = builder.header("If-Modified-Since", served);
        }
        let conditional_request = builder
            .build()
            .expect("conditional request derives from a valid request");

        if has_conditions(&conditional_request) {
            CacheStrategy {
                network_request: Some(conditional_request),
                cache_response: Some(cached),
            }
        } else {
            // No validator: the cached response is useless.
            CacheStrategy {
                network_request: Some(conditional_request),
                cache_response: None,
            }
        }
    }

    fn network_only(&self) -> CacheStrategy {
        CacheStrategy {
            network_request: Some(self.request.clone()),
            cache_response: None,
        }
    }

    /// How long the response stays fresh, counted from its served date.
    fn compute_freshness_lifetime(&self, cached: &Response) -> i64 {
        let response_caching = cached.cache_control();
        if let Some(max_age) = response_caching.max_age_seconds {
            return seconds_to_millis(max_age);
        }
        if let Some(expires) = self.expires {
            let served = self.served_date.unwrap_or(self.received_response_millis);
            return (expires - served).max(0);
        }
        if self.last_modified.is_some()
            && cached
                .request()
                .map_or(true, |r| r.url().query().is_none())
        {
            // As recommended by the HTTP RFC and implemented in Firefox,
            // default the lifetime to 10% of the document's age when it
            // was served. Not used for URIs with a query.
            let served = self.served_date.unwrap_or(self.sent_request_millis);
            let delta = served - self.last_modified.unwrap_or(0);
            return if delta > 0 { delta / 10 } else { 0 };
        }
        0
    }

    /// The current age of the response (RFC 7234 Section 4.2.3).
    fn cache_response_age(&self) -> i64 {
        let apparent_received_age = self
            .served_date
            .map_or(0, |served| (self.received_response_millis - served).max(0));
        let received_age = match self.age_seconds {
            Some(age) => apparent_received_age.max(seconds_to_millis(age)),
            None => apparent_received_age,
        };
        let response_duration = self.received_response_millis - self.sent_request_millis;
        let resident_duration = self.now_millis - self.received_response_millis;
        received_age + response_duration + resident_duration
    }

    /// True if the freshness lifetime came from the heuristic. Serving a
    /// heuristically fresh response older than a day requires a warning.
    fn is_freshness_lifetime_heuristic(
        &self,
        response_caching: &crate::cache_control::CacheControl,
    ) -> bool {
        response_caching.max_age_seconds.is_none() && self.expires.is_none()
    }
}

/// True if the request carries conditions that would let the server skip
/// the body. Requests enqueued with their own conditions bypass the cache.
fn has_conditions(request: &Request) -> bool {
    request.header("If-Modified-Since").is_some() || request.header("If-None-Match").is_some()
}

fn parse_date_millis(value: &str) -> Option<i64> {
    httpdate::parse_http_date(value).ok().map(system_time_millis)
}

pub(crate) fn system_time_millis(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn seconds_to_millis(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}
