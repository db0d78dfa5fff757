//! Policy on when asynchronous calls run.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use log::trace;

use crate::client::call::{execute_call, Call, Callback};

/// Executes enqueued calls, bounding how many run concurrently in total
/// and per host.
///
/// Synchronous calls run on their caller's thread and count only toward
/// bookkeeping; asynchronous calls wait in a FIFO queue until capacity
/// frees up, then run on a dispatcher thread.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    max_requests: usize,
    max_requests_per_host: usize,
    state: Mutex<DispatchState>,
    idle_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

#[derive(Default)]
struct DispatchState {
    ready_async: VecDeque<QueuedCall>,
    running_async: Vec<Call>,
    running_sync: Vec<Call>,
}

struct QueuedCall {
    call: Call,
    callback: Box<dyn Callback>,
}

impl Dispatcher {
    /// A dispatcher running up to `max_requests` calls, at most
    /// `max_requests_per_host` of them against any single host.
    pub fn new(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                max_requests,
                max_requests_per_host,
                state: Mutex::new(DispatchState::default()),
                idle_callback: Mutex::new(None),
            }),
        }
    }

    /// How many calls are currently executing, sync and async.
    pub fn running_calls_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.running_async.len() + state.running_sync.len()
    }

    /// How many async calls are waiting for capacity.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.state.lock().unwrap().ready_async.len()
    }

    /// Runs `callback` whenever the dispatcher becomes idle: no running
    /// and no queued calls.
    pub fn set_idle_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.idle_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Cancels every queued and running call.
    pub fn cancel_all(&self) {
        let calls: Vec<Call> = {
            let state = self.inner.state.lock().unwrap();
            state
                .ready_async
                .iter()
                .map(|queued| queued.call.clone())
                .chain(state.running_async.iter().cloned())
                .chain(state.running_sync.iter().cloned())
                .collect()
        };
        for call in calls {
            call.cancel();
        }
    }

    pub(crate) fn executed(&self, call: &Call) {
        self.inner
            .state
            .lock()
            .unwrap()
            .running_sync
            .push(call.clone());
    }

    pub(crate) fn finished_sync(&self, call: &Call) {
        {
            let mut state = self.inner.state.lock().unwrap();
            remove_call(&mut state.running_sync, call);
        }
        self.inner.after_finished();
    }

    pub(crate) fn enqueue(&self, call: Call, callback: Box<dyn Callback>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.ready_async.push_back(QueuedCall { call, callback });
        }
        self.inner.promote_and_execute();
    }
}

impl DispatcherInner {
    /// Moves eligible calls from the ready queue onto worker threads.
    /// Eligibility is FIFO, gated by the total and per-host limits.
    fn promote_and_execute(self: &Arc<Self>) {
        let executable = {
            let mut state = self.state.lock().unwrap();
            let mut executable = Vec::new();
            let mut i = 0;
            while i < state.ready_async.len() {
                if state.running_async.len() >= self.max_requests {
                    break;
                }
                let host = state.ready_async[i].call.request().url().host().to_owned();
                let host_count = state
                    .running_async
                    .iter()
                    .filter(|running| running.request().url().host() == host)
                    .count();
                if host_count >= self.max_requests_per_host {
                    i += 1;
                    continue;
                }
                let queued = state.ready_async.remove(i).expect("index checked");
                state.running_async.push(queued.call.clone());
                executable.push(queued);
            }
            executable
        };

        for queued in executable {
            let inner = self.clone();
            let result = thread::Builder::new()
                .name("courier Dispatcher".to_owned())
                .spawn(move || inner.run(queued));
            if let Err(e) = result {
                trace!("failed to spawn dispatcher thread: {}", e);
            }
        }
    }

    fn run(self: Arc<Self>, queued: QueuedCall) {
        let QueuedCall { call, callback } = queued;
        let result = execute_call(&call);
        match result {
            Ok(response) => callback.on_response(call.clone(), response),
            Err(e) => callback.on_failure(call.clone(), e),
        }
        {
            let mut state = self.state.lock().unwrap();
            remove_call(&mut state.running_async, &call);
        }
        self.after_finished();
    }

    fn after_finished(self: &Arc<Self>) {
        self.promote_and_execute();
        let idle = {
            let state = self.state.lock().unwrap();
            state.ready_async.is_empty()
                && state.running_async.is_empty()
                && state.running_sync.is_empty()
        };
        if idle {
            if let Some(ref callback) = *self.idle_callback.lock().unwrap() {
                callback();
            }
        }
    }
}

fn remove_call(calls: &mut Vec<Call>, call: &Call) {
    if let Some(i) = calls
        .iter()
        .position(|candidate| Arc::ptr_eq(&candidate.inner, &call.inner))
    {
        calls.swap_remove(i);
    }
}

impl Default for Dispatcher {
    /// Sixty-four concurrent calls, five per host.
    fn default() -> Dispatcher {
        Dispatcher::new(64, 5)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Dispatcher")
            .field("running", &(state.running_async.len() + state.running_sync.len()))
            .field("queued", &state.ready_async.len())
            .finish()
    }
}
