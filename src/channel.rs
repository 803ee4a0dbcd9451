//! Per-project event channels and the broadcaster that owns them.
//!
//! Every project gets one [`ProjectChannel`]. Publishing is synchronous and
//! never blocks: each subscriber has its own bounded queue, and when a slow
//! subscriber's queue fills up the oldest queued event is evicted to admit
//! the newest. A separate replay ring buffer holds recent history; a new
//! subscriber receives the whole ring as a single batch event before any
//! live event, under the same lock as publishing, so the replayed-then-live
//! sequence is exactly the produced sequence (up to ring truncation).
//!
//! Sequence numbers are assigned under the same lock that inserts into the
//! replay ring and the subscriber queues, so concurrent publishers (stdout
//! and stderr readers, the watchdog, control handlers) can never interleave
//! an envelope out of `seq` order.
//!
//! Heartbeats are synthesized per subscriber when `recv` has been silent for
//! the heartbeat interval; they are delivery artifacts, not published
//! events, and carry the [`EventEnvelope::ARTIFACT_SEQ`] sentinel instead of
//! a channel sequence number. Replay batch envelopes do the same.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::events::{EventEnvelope, LoopEvent};

/// Capacities and timing for one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub subscriber_queue_size: usize,
    pub replay_buffer_size: usize,
    pub heartbeat_interval: Duration,
}

impl From<&RegistryConfig> for ChannelConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            subscriber_queue_size: config.subscriber_queue_size,
            replay_buffer_size: config.replay_buffer_size,
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

/// One subscriber's bounded queue with drop-oldest overflow.
struct SubscriberQueue {
    buf: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; evicts the oldest entry when full.
    fn push(&self, env: EventEnvelope) {
        {
            let mut buf = self.buf.lock().expect("subscriber queue poisoned");
            if buf.len() >= self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(env);
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<EventEnvelope> {
        self.buf
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    async fn pop(&self) -> Option<EventEnvelope> {
        loop {
            // arm the waiter before checking, otherwise a push between the
            // check and the await is lost
            let notified = self.notify.notified();
            if let Some(env) = self.try_pop() {
                return Some(env);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ChannelState {
    subscribers: Vec<(u64, Arc<SubscriberQueue>)>,
    replay: VecDeque<EventEnvelope>,
    next_subscriber_id: u64,
    /// Last assigned sequence number; guarded by the state lock so the
    /// stamp and the insertion are one atomic step.
    seq: u64,
}

struct ChannelInner {
    project_id: Uuid,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    closed: AtomicBool,
}

/// Event channel for a single project.
#[derive(Clone)]
pub struct ProjectChannel {
    inner: Arc<ChannelInner>,
}

impl ProjectChannel {
    /// Create a channel for a project.
    pub fn new(project_id: Uuid, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                project_id,
                config,
                state: Mutex::new(ChannelState {
                    subscribers: Vec::new(),
                    replay: VecDeque::new(),
                    next_subscriber_id: 0,
                    seq: 0,
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Project this channel belongs to.
    pub fn project_id(&self) -> Uuid {
        self.inner.project_id
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("channel state poisoned")
            .subscribers
            .len()
    }

    /// Publish one event to the replay ring and every subscriber.
    ///
    /// Synchronous and non-blocking regardless of subscriber speed. Returns
    /// the envelope the event was delivered in.
    pub fn publish(&self, event: LoopEvent) -> EventEnvelope {
        let mut state = self.inner.state.lock().expect("channel state poisoned");
        state.seq += 1;
        let env = EventEnvelope::new(self.inner.project_id, state.seq, event);

        if state.replay.len() >= self.inner.config.replay_buffer_size {
            state.replay.pop_front();
        }
        state.replay.push_back(env.clone());

        for (_, queue) in &state.subscribers {
            queue.push(env.clone());
        }
        env
    }

    /// Attach a new subscriber.
    ///
    /// The subscription's first received event is a [`LoopEvent::Replay`]
    /// batch holding the current replay ring (possibly empty), followed by
    /// live events in production order.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.inner.config.subscriber_queue_size));

        let mut state = self.inner.state.lock().expect("channel state poisoned");
        let events: Vec<EventEnvelope> = state.replay.iter().cloned().collect();
        let count = events.len();
        queue.push(EventEnvelope::new(
            self.inner.project_id,
            EventEnvelope::ARTIFACT_SEQ,
            LoopEvent::Replay { events, count },
        ));

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push((id, Arc::clone(&queue)));
        debug!(
            project_id = %self.inner.project_id,
            subscribers = state.subscribers.len(),
            "subscriber connected"
        );

        if self.inner.closed.load(Ordering::Acquire) {
            queue.close();
        }

        Subscription {
            id,
            queue,
            channel: Arc::downgrade(&self.inner),
            heartbeat: self.inner.config.heartbeat_interval,
        }
    }

    /// Close the channel; every subscriber's stream ends after it drains.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let state = self.inner.state.lock().expect("channel state poisoned");
        for (_, queue) in &state.subscribers {
            queue.close();
        }
        info!(
            project_id = %self.inner.project_id,
            subscribers = state.subscribers.len(),
            "channel closed"
        );
    }
}

/// A live subscription to one project's events.
///
/// Dropping the subscription detaches it from the channel.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    channel: Weak<ChannelInner>,
    heartbeat: Duration,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// Returns `None` once the channel is closed and the queue is drained.
    /// When nothing arrives within the heartbeat interval, a heartbeat
    /// envelope is synthesized so transports can detect dead peers.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        match timeout(self.heartbeat, self.queue.pop()).await {
            Ok(result) => result,
            Err(_) => {
                let project_id = match self.channel.upgrade() {
                    Some(inner) => inner.project_id,
                    None => return None,
                };
                Some(EventEnvelope::new(
                    project_id,
                    EventEnvelope::ARTIFACT_SEQ,
                    LoopEvent::Heartbeat,
                ))
            }
        }
    }

    /// Events evicted from this subscriber's queue so far.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            let mut state = inner.state.lock().expect("channel state poisoned");
            state.subscribers.retain(|(id, _)| *id != self.id);
            debug!(
                project_id = %inner.project_id,
                subscribers = state.subscribers.len(),
                "subscriber disconnected"
            );
        }
    }
}

/// Owns every project's channel; routes events only to their own project.
pub struct Broadcaster {
    config: ChannelConfig,
    channels: RwLock<HashMap<Uuid, ProjectChannel>>,
}

impl Broadcaster {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Channel for a project, created on first use.
    pub fn channel(&self, project_id: Uuid) -> ProjectChannel {
        if let Some(channel) = self
            .channels
            .read()
            .expect("broadcaster poisoned")
            .get(&project_id)
        {
            return channel.clone();
        }
        let mut channels = self.channels.write().expect("broadcaster poisoned");
        channels
            .entry(project_id)
            .or_insert_with(|| ProjectChannel::new(project_id, self.config.clone()))
            .clone()
    }

    /// Existing channel, if any.
    pub fn get(&self, project_id: Uuid) -> Option<ProjectChannel> {
        self.channels
            .read()
            .expect("broadcaster poisoned")
            .get(&project_id)
            .cloned()
    }

    /// Close and drop a project's channel (unregistration).
    pub fn remove(&self, project_id: Uuid) {
        if let Some(channel) = self
            .channels
            .write()
            .expect("broadcaster poisoned")
            .remove(&project_id)
        {
            channel.close();
        }
    }

    /// Close every channel.
    pub fn shutdown(&self) {
        let channels = self.channels.read().expect("broadcaster poisoned");
        for channel in channels.values() {
            channel.close();
        }
    }
}
