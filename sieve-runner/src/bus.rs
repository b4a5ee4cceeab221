//! Bounded publish/subscribe event bus.
//!
//! Publishers never block: a full queue drops the event and counts it. One
//! background consumer drains the queue with a bounded poll timeout so a stop
//! request is seen promptly, and dispatches each event to every handler
//! registered for its topic. A handler error or panic is caught, logged, and
//! counted; it never reaches the loop or the other handlers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use sieve_core::config::ConfigError;

/// Bus queue and reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
    pub poll_timeout_ms: u64,
    pub report_interval_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            poll_timeout_ms: 100,
            report_interval_secs: 10,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::TooSmall {
                field: "bus.capacity",
                value: 0,
                min: 1,
            });
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "bus.poll_timeout_ms",
                value: 0.0,
            });
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::NotPositive {
                field: "bus.report_interval_secs",
                value: 0.0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to spawn bus consumer: {0}")]
    Spawn(String),

    #[error("bus consumer panicked")]
    ConsumerPanicked,
}

/// A handler's own failure, caught by the bus.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Topic handler. Called on the consumer thread, in delivery order.
pub type Handler<T> = Arc<dyn Fn(&T) -> Result<(), HandlerError> + Send + Sync>;

/// Point-in-time bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub queue_len: usize,
    /// Processed events per second since the consumer started.
    pub throughput_per_sec: f64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

struct Envelope<T> {
    topic: String,
    payload: T,
}

type HandlerMap<T> = HashMap<String, Vec<Handler<T>>>;

/// Bounded FIFO bus with a single background consumer.
pub struct EventBus<T: Send + 'static> {
    config: BusConfig,
    tx: Sender<Envelope<T>>,
    rx: Receiver<Envelope<T>>,
    handlers: Arc<RwLock<HandlerMap<T>>>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    started_at: Mutex<Option<Instant>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> EventBus<T> {
    pub fn new(config: BusConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, rx) = bounded(config.capacity);
        Ok(Self {
            config,
            tx,
            rx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Register a handler for `topic`. Handlers may be added while running.
    pub fn subscribe(&self, topic: &str, handler: Handler<T>) {
        self.handlers
            .write()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Drop every handler for `topic`.
    pub fn unsubscribe(&self, topic: &str) {
        self.handlers.write().unwrap().remove(topic);
    }

    /// Enqueue without blocking. Returns false if the event was dropped.
    pub fn publish(&self, topic: &str, payload: T) -> bool {
        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, capacity = self.config.capacity, "event bus full, dropping events");
                }
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the consumer. Starting a running bus is a no-op.
    pub fn start(&self) -> Result<(), BusError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let started = Instant::now();
        *self.started_at.lock().unwrap() = Some(started);

        let rx = self.rx.clone();
        let handlers = Arc::clone(&self.handlers);
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.running);
        let poll = Duration::from_millis(self.config.poll_timeout_ms);
        let report_every = Duration::from_secs(self.config.report_interval_secs);

        let handle = thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || {
                consume(rx, handlers, counters, running, poll, report_every, started)
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                BusError::Spawn(e.to_string())
            })?;
        *worker = Some(handle);
        info!(capacity = self.config.capacity, "event bus started");
        Ok(())
    }

    /// Stop the consumer and wait for it. Stopping a stopped bus is a no-op.
    pub fn stop(&self) -> Result<(), BusError> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| BusError::ConsumerPanicked)?;
            let stats = self.stats();
            info!(
                published = stats.published,
                processed = stats.processed,
                dropped = stats.dropped,
                handler_failures = stats.handler_failures,
                "event bus stopped"
            );
        }
        Ok(())
    }

    pub fn stats(&self) -> BusStats {
        let started = *self.started_at.lock().unwrap();
        snapshot(&self.counters, self.rx.len(), started)
    }
}

impl<T: Send + 'static> Drop for EventBus<T> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn snapshot(counters: &Counters, queue_len: usize, started: Option<Instant>) -> BusStats {
    let processed = counters.processed.load(Ordering::Relaxed);
    let elapsed = started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
    BusStats {
        published: counters.published.load(Ordering::Relaxed),
        processed,
        dropped: counters.dropped.load(Ordering::Relaxed),
        handler_failures: counters.handler_failures.load(Ordering::Relaxed),
        queue_len,
        throughput_per_sec: if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        },
    }
}

fn consume<T>(
    rx: Receiver<Envelope<T>>,
    handlers: Arc<RwLock<HandlerMap<T>>>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    poll: Duration,
    report_every: Duration,
    started: Instant,
) {
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(poll) {
            Ok(envelope) => {
                let targets: Vec<Handler<T>> = handlers
                    .read()
                    .unwrap()
                    .get(&envelope.topic)
                    .cloned()
                    .unwrap_or_default();
                for handler in targets {
                    match catch_unwind(AssertUnwindSafe(|| handler(&envelope.payload))) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(topic = %envelope.topic, error = %err, "bus handler failed");
                        }
                        Err(_) => {
                            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(topic = %envelope.topic, "bus handler panicked");
                        }
                    }
                }
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_report.elapsed() >= report_every {
            let stats = snapshot(&counters, rx.len(), Some(started));
            info!(
                published = stats.published,
                processed = stats.processed,
                dropped = stats.dropped,
                handler_failures = stats.handler_failures,
                queue_len = stats.queue_len,
                throughput_per_sec = stats.throughput_per_sec,
                "event bus report"
            );
            last_report = Instant::now();
        }
    }
    debug!("event bus consumer exiting");
}
