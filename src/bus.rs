// =============================================================================
// Message Bus — durable publish/subscribe over dot-separated subjects
// =============================================================================
//
// An embedded bus with the contract the rest of the engine is written
// against: hierarchical subjects (`market.kline.1m.BTCUSDT`), single-token
// `*` wildcards, named durable consumers with work-queue sharing, and manual
// acknowledgement. Handlers run on bus-owned delivery tasks; anything heavy
// must be handed off to the consumer's own channel or worker pool.
//
// Delivery queues are bounded. A full queue drops the message and bumps a
// counter — back-pressure never blocks the publisher.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Subject matching
// ---------------------------------------------------------------------------

/// Match `subject` against `pattern`. Both are dot-separated token lists;
/// a `*` in the pattern matches exactly one token.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Acknowledgement
// ---------------------------------------------------------------------------

/// How a subscription acknowledges deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The handler must call [`Delivery::ack`] after the record has been
    /// incorporated into local state.
    Manual,
    /// The bus acknowledges on delivery, before the handler runs.
    Auto,
}

/// Subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOpts {
    /// Durable consumer name. Subscriptions sharing a name form a consumer
    /// group: each message goes to exactly one member.
    pub durable: Option<String>,
    pub ack_mode: AckMode,
}

impl SubscribeOpts {
    /// Durable consumer with manual acknowledgement.
    pub fn durable(name: &str) -> Self {
        Self {
            durable: Some(name.to_string()),
            ack_mode: AckMode::Manual,
        }
    }

    /// Ephemeral consumer, acknowledged by the bus on delivery.
    pub fn ephemeral() -> Self {
        Self {
            durable: None,
            ack_mode: AckMode::Auto,
        }
    }
}

/// One message handed to a subscription handler.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    acked: Arc<AtomicBool>,
    stats: Arc<BusStatsInner>,
}

impl Delivery {
    /// Acknowledge this delivery. Idempotent.
    pub fn ack(&self) {
        if !self.acked.swap(true, Ordering::AcqRel) {
            self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // A delivery dropped without ack would be redelivered by a networked
        // bus; here it is only counted so the gap stays observable.
        if !self.acked.load(Ordering::Acquire) {
            self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.stats.unacked.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Bus internals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusStatsInner {
    published: AtomicU64,
    dropped: AtomicU64,
    unacked: AtomicU64,
    in_flight: AtomicU64,
}

/// Counter snapshot for logs and health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Messages lost to full delivery queues.
    pub dropped: u64,
    /// Deliveries whose handler finished without acknowledging.
    pub unacked: u64,
    pub in_flight: u64,
}

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<Delivery>,
}

/// The shared queue behind one durable consumer group.
struct DurableQueue {
    pattern: String,
    rx: Arc<AsyncMutex<mpsc::Receiver<Delivery>>>,
}

struct BusInner {
    queue_depth: usize,
    subscriptions: RwLock<Vec<Subscription>>,
    /// Durable name -> shared queue, so group members compete for messages.
    durables: RwLock<HashMap<String, DurableQueue>>,
    stats: Arc<BusStatsInner>,
}

/// Cheaply cloneable handle to the process-wide bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus whose per-subscription delivery queues hold `queue_depth`
    /// messages.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue_depth,
                subscriptions: RwLock::new(Vec::new()),
                durables: RwLock::new(HashMap::new()),
                stats: Arc::new(BusStatsInner::default()),
            }),
        }
    }

    /// Publish `payload` to every subscription whose pattern matches
    /// `subject`. Never blocks; full queues drop and count.
    pub fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);

        let subs = self.inner.subscriptions.read();
        for sub in subs.iter() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            let delivery = Delivery {
                subject: subject.to_string(),
                payload: payload.clone(),
                acked: Arc::new(AtomicBool::new(false)),
                stats: self.inner.stats.clone(),
            };
            self.inner.stats.in_flight.fetch_add(1, Ordering::Relaxed);
            if let Err(mpsc::error::TrySendError::Full(rejected)) = sub.tx.try_send(delivery) {
                // Mark as handled so the drop isn't double-counted as unacked.
                rejected.ack();
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(subject, pattern = %sub.pattern, "delivery queue full, message dropped");
            }
        }
        Ok(())
    }

    /// Subscribe `handler` to every subject matching `pattern`.
    ///
    /// The handler runs on a bus-owned delivery task. With
    /// [`AckMode::Manual`] the handler is responsible for calling
    /// [`Delivery::ack`]; with [`AckMode::Auto`] the bus acks on return.
    pub fn subscribe<F>(&self, pattern: &str, opts: SubscribeOpts, handler: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let rx = self.register(pattern, &opts);
        let ack_mode = opts.ack_mode;
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            debug!(pattern = %pattern, "delivery task started");
            loop {
                let delivery = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                match delivery {
                    Some(delivery) => {
                        if ack_mode == AckMode::Auto {
                            delivery.ack();
                        }
                        handler(delivery);
                    }
                    None => {
                        debug!(pattern = %pattern, "delivery task stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Register a queue for `pattern`. A durable name already in use joins
    /// the existing group: the new delivery task competes on the shared
    /// queue instead of adding a second subscription (which would duplicate
    /// deliveries). The first subscription's pattern binds the group.
    fn register(
        &self,
        pattern: &str,
        opts: &SubscribeOpts,
    ) -> Arc<AsyncMutex<mpsc::Receiver<Delivery>>> {
        if let Some(name) = &opts.durable {
            let mut durables = self.inner.durables.write();
            if let Some(queue) = durables.get(name) {
                if queue.pattern != pattern {
                    warn!(
                        durable = %name,
                        group_pattern = %queue.pattern,
                        requested = %pattern,
                        "joining durable group with a different pattern, group pattern wins"
                    );
                }
                return queue.rx.clone();
            }

            let (tx, rx) = mpsc::channel(self.inner.queue_depth);
            let rx = Arc::new(AsyncMutex::new(rx));
            durables.insert(
                name.clone(),
                DurableQueue {
                    pattern: pattern.to_string(),
                    rx: rx.clone(),
                },
            );
            self.inner.subscriptions.write().push(Subscription {
                pattern: pattern.to_string(),
                tx,
            });
            return rx;
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        self.inner.subscriptions.write().push(Subscription {
            pattern: pattern.to_string(),
            tx,
        });
        Arc::new(AsyncMutex::new(rx))
    }

    /// Snapshot of the bus counters.
    pub fn stats(&self) -> BusStats {
        let s = &self.inner.stats;
        BusStats {
            published: s.published.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            unacked: s.unacked.load(Ordering::Relaxed),
            in_flight: s.in_flight.load(Ordering::Relaxed),
        }
    }
}
