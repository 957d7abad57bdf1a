//! In-process event bus.
//!
//! Mutations announce domain events (`content.update`, `user.delete`, ...)
//! and cache bindings subscribe to them. Every emit is recorded in a bounded
//! log before any handler runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::HandlerError;
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::events";

const METRIC_HANDLER_ERROR: &str = "tiercache_event_handler_error_total";
const METRIC_EMIT_MS: &str = "tiercache_emit_ms";
const METRIC_LOG_LEN: &str = "tiercache_event_log_len";

/// Event name whose handlers see every emitted event.
pub const WILDCARD: &str = "*";

/// Default number of retained log entries.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// One emitted event as kept in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub event: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub data: Value,
}

/// Emit history summary.
///
/// `total_events` and `event_counts` come from the retained log, so they
/// describe recent history rather than everything ever emitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub total_events: usize,
    /// Number of event names with at least one live handler.
    pub total_subscriptions: usize,
    pub event_counts: BTreeMap<String, usize>,
}

struct Registration {
    id: u64,
    handler: Handler,
}

struct BusInner {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    log: Mutex<VecDeque<EventRecord>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, event: &str, id: u64) -> bool {
        let mut handlers = rw_write(&self.handlers, SOURCE, "unsubscribe");
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|registration| registration.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }
}

/// Publish/subscribe hub shared by every component of a process.
///
/// Cloning is cheap and every clone talks to the same subscriptions.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by [`EventBus::on`].
///
/// `unsubscribe` removes exactly the handler it was created for and may be
/// called any number of times. Dropping the handle keeps the handler.
pub struct Subscription {
    bus: Weak<BusInner>,
    event: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(&self.event, self.id) {
                debug!(event = %self.event, "Event handler unsubscribed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Bus that retains at most `capacity` log entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                log: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `handler` for `event` (or [`WILDCARD`]).
    pub fn on<F, Fut>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |data| handler(data).boxed());
        self.on_handler(event, handler)
    }

    /// Register an already boxed handler.
    pub fn on_handler(&self, event: &str, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        rw_write(&self.inner.handlers, SOURCE, "on")
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, handler });
        debug!(event, "Event handler subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove every handler for `event`.
    pub fn off(&self, event: &str) {
        if rw_write(&self.inner.handlers, SOURCE, "off")
            .remove(event)
            .is_some()
        {
            info!(event, "Event handlers removed");
        }
    }

    /// Record the event, then run all matching handlers concurrently.
    ///
    /// Returns once every handler has settled. Handler errors and panics
    /// are logged and counted but never reach the caller.
    pub async fn emit(&self, event: &str, data: Value) {
        let started = Instant::now();
        self.record(event, &data);

        let (direct, wildcard) = {
            let handlers = rw_read(&self.inner.handlers, SOURCE, "emit");
            let collect = |name: &str| -> Vec<Handler> {
                handlers
                    .get(name)
                    .map(|list| list.iter().map(|r| Arc::clone(&r.handler)).collect())
                    .unwrap_or_default()
            };
            let wildcard = if event == WILDCARD {
                Vec::new()
            } else {
                collect(WILDCARD)
            };
            (collect(event), wildcard)
        };

        let handler_count = direct.len() + wildcard.len();
        let mut calls = Vec::with_capacity(handler_count);
        for handler in direct {
            calls.push(invoke(event, handler, data.clone()));
        }
        if !wildcard.is_empty() {
            let envelope = json!({ "event": event, "data": data });
            for handler in wildcard {
                calls.push(invoke(event, handler, envelope.clone()));
            }
        }
        join_all(calls).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_EMIT_MS).record(elapsed_ms);
        debug!(event, handlers = handler_count, elapsed_ms, "Event emitted");
    }

    fn record(&self, event: &str, data: &Value) {
        let record = EventRecord {
            id: Uuid::new_v4(),
            event: event.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            data: data.clone(),
        };
        let mut log = mutex_lock(&self.inner.log, SOURCE, "emit.record");
        log.push_back(record);
        while log.len() > self.inner.capacity {
            log.pop_front();
        }
        gauge!(METRIC_LOG_LEN).set(log.len() as f64);
    }

    pub fn get_stats(&self) -> EventStats {
        let mut event_counts = BTreeMap::new();
        let total_events = {
            let log = mutex_lock(&self.inner.log, SOURCE, "get_stats");
            for record in log.iter() {
                *event_counts.entry(record.event.clone()).or_insert(0) += 1;
            }
            log.len()
        };
        let total_subscriptions = rw_read(&self.inner.handlers, SOURCE, "get_stats").len();

        EventStats {
            total_events,
            total_subscriptions,
            event_counts,
        }
    }

    /// Event names with at least one handler, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.inner.handlers, SOURCE, "events")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        rw_read(&self.inner.handlers, SOURCE, "subscriber_count")
            .get(event)
            .map_or(0, Vec::len)
    }

    /// The most recent `limit` log entries (all when `None`), oldest first.
    pub fn event_log(&self, limit: Option<usize>) -> Vec<EventRecord> {
        let log = mutex_lock(&self.inner.log, SOURCE, "event_log");
        let skip = limit.map_or(0, |limit| log.len().saturating_sub(limit));
        log.iter().skip(skip).cloned().collect()
    }

    pub fn clear_event_log(&self) {
        mutex_lock(&self.inner.log, SOURCE, "clear_event_log").clear();
        gauge!(METRIC_LOG_LEN).set(0.0);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one handler in isolation.
///
/// The handler is called inside the guarded future so a panic raised before
/// its first await is caught too.
async fn invoke(event: &str, handler: Handler, payload: Value) {
    let outcome = AssertUnwindSafe(async move { handler(payload).await })
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
    };

    warn!(event, error = %failure, "Event handler failed");
    counter!(METRIC_HANDLER_ERROR, "event" => event.to_string()).increment(1);
}
