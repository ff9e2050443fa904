//! Policy on when asynchronous calls execute.
//!
//! The dispatcher bounds concurrency globally and per host, queueing the
//! overflow in submission order. Hosts are counted by URL host string
//! only: concurrent requests to one IP can exceed the per-host cap when
//! several hostnames share an address or a proxy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::call::CallState;
use crate::metrics;

const DEFAULT_MAX_REQUESTS: usize = 64;
const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// Identity and cancellation state of one call, as the dispatcher sees
/// it.
pub(crate) struct CallHandle {
    pub id: u64,
    pub host: String,
    pub tag: Option<String>,
    pub state: Arc<CallState>,
}

/// A queued asynchronous call: its handle plus the work to run.
pub(crate) struct AsyncJob {
    pub handle: CallHandle,
    pub run: Box<dyn FnOnce() + Send>,
}

struct DispatcherState {
    max_requests: usize,
    max_requests_per_host: usize,
    /// Ready calls in the order they will run.
    ready: VecDeque<AsyncJob>,
    /// Running calls, including canceled ones that have not finished.
    running: Vec<CallHandle>,
    /// In-flight synchronous calls, registered for cancellation only.
    executed_sync: Vec<CallHandle>,
}

/// Schedules asynchronous calls under global and per-host caps.
pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    executor: Executor,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            state: Mutex::new(DispatcherState {
                max_requests: DEFAULT_MAX_REQUESTS,
                max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
                ready: VecDeque::new(),
                running: Vec::new(),
                executed_sync: Vec::new(),
            }),
            executor: Executor::new("hawser-dispatcher"),
        }
    }
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Maximum requests to execute concurrently; above it calls queue.
    /// In-flight calls above a lowered cap are not preempted.
    ///
    /// # Panics
    ///
    /// If `max_requests` is zero.
    pub fn set_max_requests(&self, max_requests: usize) {
        assert!(max_requests >= 1, "max < 1: {max_requests}");
        let mut state = self.state.lock();
        state.max_requests = max_requests;
        self.promote_calls(&mut state);
    }

    pub fn max_requests(&self) -> usize {
        self.state.lock().max_requests
    }

    /// Maximum concurrent requests per URL host. Concurrency to a single
    /// IP may still exceed this: hostnames share addresses and proxies.
    ///
    /// # Panics
    ///
    /// If `max_requests_per_host` is zero.
    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) {
        assert!(
            max_requests_per_host >= 1,
            "max < 1: {max_requests_per_host}"
        );
        let mut state = self.state.lock();
        state.max_requests_per_host = max_requests_per_host;
        self.promote_calls(&mut state);
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.state.lock().max_requests_per_host
    }

    pub(crate) fn enqueue(&self, job: AsyncJob) {
        let mut state = self.state.lock();
        if state.running.len() < state.max_requests
            && running_for_host(&state.running, &job.handle.host) < state.max_requests_per_host
        {
            metrics::DISPATCHER_RUNNING.increment();
            state.running.push(job.handle);
            self.executor.execute(job.run);
        } else {
            state.ready.push_back(job);
        }
    }

    /// Cancel all calls tagged `tag`, queued or in flight.
    pub fn cancel(&self, tag: &str) {
        let state = self.state.lock();
        for job in &state.ready {
            if job.handle.tag.as_deref() == Some(tag) {
                job.handle.state.cancel();
            }
        }
        for handle in &state.running {
            if handle.tag.as_deref() == Some(tag) {
                handle.state.cancel();
            }
        }
        for handle in &state.executed_sync {
            if handle.tag.as_deref() == Some(tag) {
                handle.state.cancel();
            }
        }
    }

    /// Signal completion of an asynchronous call.
    pub(crate) fn finished(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(index) = state.running.iter().position(|h| h.id == id) {
            state.running.remove(index);
            metrics::DISPATCHER_RUNNING.decrement();
        }
        self.promote_calls(&mut state);
    }

    /// Register an in-flight synchronous call for cancellation.
    pub(crate) fn executed(&self, handle: CallHandle) {
        self.state.lock().executed_sync.push(handle);
    }

    /// Signal completion of a synchronous call.
    pub(crate) fn finished_sync(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(index) = state.executed_sync.iter().position(|h| h.id == id) {
            state.executed_sync.remove(index);
        }
    }

    /// Move ready calls into the running set while both caps allow.
    fn promote_calls(&self, state: &mut DispatcherState) {
        if state.running.len() >= state.max_requests {
            return; // Already at capacity.
        }
        let mut index = 0;
        while index < state.ready.len() {
            if state.running.len() >= state.max_requests {
                return;
            }
            let host_ok = {
                let job = &state.ready[index];
                running_for_host(&state.running, &job.handle.host) < state.max_requests_per_host
            };
            if host_ok {
                if let Some(job) = state.ready.remove(index) {
                    metrics::DISPATCHER_RUNNING.increment();
                    state.running.push(job.handle);
                    self.executor.execute(job.run);
                }
            } else {
                index += 1;
            }
        }
    }

    pub fn running_call_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn queued_call_count(&self) -> usize {
        self.state.lock().ready.len()
    }
}

fn running_for_host(running: &[CallHandle], host: &str) -> usize {
    running.iter().filter(|h| h.host == host).count()
}

// -- Executor --

type Job = Box<dyn FnOnce() + Send>;

/// How long an idle worker thread waits for more work before exiting.
const WORKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// A grow-on-demand thread pool with direct handoff: a submitted job goes
/// to an idle worker if one is waiting, else a fresh thread. Workers die
/// after sixty idle seconds, so a quiet dispatcher holds no threads.
pub(crate) struct Executor {
    name: &'static str,
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    state: Mutex<ExecutorState>,
    work_available: Condvar,
}

struct ExecutorState {
    queue: VecDeque<Job>,
    idle_workers: usize,
}

impl Executor {
    pub fn new(name: &'static str) -> Executor {
        Executor {
            name,
            inner: Arc::new(ExecutorInner {
                state: Mutex::new(ExecutorState {
                    queue: VecDeque::new(),
                    idle_workers: 0,
                }),
                work_available: Condvar::new(),
            }),
        }
    }

    pub fn execute(&self, job: Job) {
        {
            let mut state = self.inner.state.lock();
            if state.idle_workers > 0 {
                state.queue.push_back(job);
                self.inner.work_available.notify_one();
                return;
            }
        }
        self.spawn_worker(job);
    }

    fn spawn_worker(&self, initial: Job) {
        let inner = self.inner.clone();
        thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || {
                let mut job = initial;
                loop {
                    job();
                    match inner.next_job() {
                        Some(next) => job = next,
                        None => return,
                    }
                }
            })
            .expect("failed to spawn dispatcher worker thread");
    }
}

impl ExecutorInner {
    /// Wait up to the keep-alive for more work; `None` retires the
    /// worker.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        state.idle_workers += 1;
        loop {
            if let Some(job) = state.queue.pop_front() {
                state.idle_workers -= 1;
                return Some(job);
            }
            if self
                .work_available
                .wait_for(&mut state, WORKER_KEEP_ALIVE)
                .timed_out()
            {
                let job = state.queue.pop_front();
                state.idle_workers -= 1;
                return job;
            }
        }
    }
}
