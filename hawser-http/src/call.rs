//! A call: one request and its eventual response, through every
//! follow-up and recovery attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::client::ClientInner;
use crate::connection::ShutdownHandle;
use crate::dispatcher::{AsyncJob, CallHandle};
use crate::engine::{Engine, MAX_FOLLOW_UPS};
use crate::error::HttpError;
use crate::metrics;
use crate::request::Request;
use crate::response::Response;

/// Cancellation state shared between a call, its engine, and the
/// dispatcher. Cancellation is idempotent and best-effort: the socket is
/// shut down and in-flight blocking IO observes the close as an error.
pub(crate) struct CallState {
    canceled: AtomicBool,
    shutdown: Mutex<Option<Arc<dyn ShutdownHandle>>>,
}

impl CallState {
    pub fn new() -> Arc<CallState> {
        Arc::new(CallState {
            canceled: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        })
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            metrics::CALLS_CANCELED.increment();
        }
        if let Some(handle) = self.shutdown.lock().as_ref() {
            handle.shutdown();
        }
    }

    /// Point cancellation at the call's current socket.
    pub fn set_shutdown(&self, handle: Arc<dyn ShutdownHandle>) {
        *self.shutdown.lock() = Some(handle);
        // Cancel may have raced the connect; close the fresh socket too.
        if self.is_canceled() {
            if let Some(handle) = self.shutdown.lock().as_ref() {
                handle.shutdown();
            }
        }
    }
}

struct CallInner {
    client: Arc<ClientInner>,
    request: Mutex<Option<Request>>,
    host: String,
    tag: Option<String>,
    state: Arc<CallState>,
    executed: AtomicBool,
    id: u64,
}

/// A single request/response exchange, executable exactly once.
/// Cloning yields another handle to the same call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientInner>, request: Request) -> Call {
        let id = client.next_engine_id();
        let host = request.url().host_str().unwrap_or_default().to_string();
        let tag = request.tag().map(str::to_string);
        Call {
            inner: Arc::new(CallInner {
                client,
                request: Mutex::new(Some(request)),
                host,
                tag,
                state: CallState::new(),
                executed: AtomicBool::new(false),
                id,
            }),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.state.is_canceled()
    }

    /// Cancel this call. A finished call is unaffected; an in-flight one
    /// observes an IO error as its socket closes.
    pub fn cancel(&self) {
        self.inner.state.cancel();
    }

    pub fn tag(&self) -> Option<&str> {
        self.inner.tag.as_deref()
    }

    /// Execute on the calling thread. The dispatcher only learns about
    /// the call so tag cancellation can reach it.
    pub fn execute(&self) -> Result<Response, HttpError> {
        if self.inner.executed.swap(true, Ordering::AcqRel) {
            return Err(HttpError::Request("call already executed".to_string()));
        }
        self.inner.client.dispatcher.executed(self.handle());
        let result = self.response_with_follow_ups();
        self.inner.client.dispatcher.finished_sync(self.inner.id);
        result
    }

    /// Queue for execution on the dispatcher's executor. The callback
    /// fires exactly once, on a dispatcher thread.
    pub fn enqueue(
        &self,
        callback: impl FnOnce(Result<Response, HttpError>) + Send + 'static,
    ) {
        if self.inner.executed.swap(true, Ordering::AcqRel) {
            callback(Err(HttpError::Request("call already executed".to_string())));
            return;
        }
        let call = self.clone();
        let id = self.inner.id;
        let job = AsyncJob {
            handle: self.handle(),
            run: Box::new(move || {
                let result = call.response_with_follow_ups();
                callback(result);
                call.inner.client.dispatcher.finished(id);
            }),
        };
        self.inner.client.dispatcher.enqueue(job);
    }

    fn handle(&self) -> CallHandle {
        CallHandle {
            id: self.inner.id,
            host: self.inner.host.clone(),
            tag: self.inner.tag.clone(),
            state: self.inner.state.clone(),
        }
    }

    /// Drive engines until a response needs no follow-up, recovering onto
    /// new routes when the failure allows it.
    fn response_with_follow_ups(&self) -> Result<Response, HttpError> {
        let request = match self.inner.request.lock().take() {
            Some(request) => request,
            None => return Err(HttpError::Request("call already executed".to_string())),
        };

        let mut engine = Engine::new(
            self.inner.client.clone(),
            request,
            false,
            false,
            None,
            None,
            None,
            None,
            Some(self.inner.state.clone()),
        );
        let mut follow_up_count: u32 = 0;

        loop {
            if self.inner.state.is_canceled() {
                engine.close();
                return Err(HttpError::Canceled);
            }

            let step = engine
                .send_request()
                .and_then(|()| engine.read_response());
            if let Err(error) = step {
                engine = engine.recover(error)?;
                continue;
            }

            let follow_up = match engine.follow_up_request() {
                Ok(follow_up) => follow_up,
                Err(error) => {
                    engine.close();
                    return Err(error);
                }
            };

            let follow_up = match follow_up {
                None => {
                    engine.release_connection()?;
                    return match engine.take_response() {
                        Some(response) => Ok(response),
                        None => Err(HttpError::Request("engine produced no response".to_string())),
                    };
                }
                Some(follow_up) => follow_up,
            };

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                engine.close();
                return Err(HttpError::TooManyFollowUps(MAX_FOLLOW_UPS));
            }
            debug!(
                follow_up_count,
                url = %follow_up.url(),
                "executing follow-up request"
            );

            let same_connection = engine.same_connection(follow_up.url());
            if !same_connection {
                engine.release_connection()?;
            }
            // Close drops the response body and hands back a reusable
            // connection; the skeleton survives as the prior response.
            let connection = engine.close();
            let prior = engine.take_response().map(Response::strip_body);

            engine = Engine::new(
                self.inner.client.clone(),
                follow_up,
                false,
                false,
                connection,
                None,
                None,
                prior,
                Some(self.inner.state.clone()),
            );
        }
    }
}
