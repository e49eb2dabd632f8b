//! Fan-in/fan-out message broker.
//!
//! ```text
//! producers ──send_message──► inbound queue ──► dispatcher ──try_send──► outboxes
//!                                 (bounded)        (one task)      (per subscriber)
//! ```
//!
//! Producers block on the bounded inbound queue (backpressure). The single
//! dispatch loop drains it in arrival order and never blocks on a subscriber:
//! a full or closed outbox loses that message for that subscriber only.
//! Every pending send and the loop itself race the same cancellation token;
//! once it fires nothing more is delivered and queued leftovers are abandoned.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU8, AtomicU64, Ordering},
};

use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    config::BrokerConfig,
    error::BrokerError,
    message::Message,
    registry::{Outbox, Registry},
};

/// Where a broker is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed; `run` has not been called.
    Created,
    /// The dispatch loop is draining the inbound queue.
    Running,
    /// Cancellation was observed and the dispatch loop has exited.
    Stopped,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Created,
            1 => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Created => 0,
            LifecycleState::Running => 1,
            LifecycleState::Stopped => 2,
        }
    }
}

/// Point-in-time delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages taken off the inbound queue and routed.
    pub dispatched: u64,
    /// Successful hand-offs to a subscriber outbox.
    pub delivered: u64,
    /// Deliveries skipped because the outbox was full.
    pub dropped_full: u64,
    /// Deliveries skipped because the receiving half was gone.
    pub dropped_closed: u64,
    /// Private messages whose recipient was not registered.
    pub dropped_unroutable: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_closed: AtomicU64,
    dropped_unroutable: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            dropped_unroutable: self.dropped_unroutable.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a broker instance. Clones share the same queue, registry and
/// lifecycle.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

struct Shared {
    config: BrokerConfig,
    inbound: mpsc::Sender<Message>,
    // Taken exactly once by `run`.
    pending: Mutex<Option<mpsc::Receiver<Message>>>,
    registry: Registry,
    cancel: CancellationToken,
    stopped: CancellationToken,
    state: AtomicU8,
    counters: Counters,
}

impl Broker {
    /// Creates a broker with the reference inbound capacity.
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_config(cancel, BrokerConfig::default())
    }

    pub fn with_config(cancel: CancellationToken, config: BrokerConfig) -> Self {
        let config = BrokerConfig::with_inbound_capacity(config.inbound_capacity);
        let (inbound, pending) = mpsc::channel(config.inbound_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                inbound,
                pending: Mutex::new(Some(pending)),
                registry: Registry::new(),
                cancel,
                stopped: CancellationToken::new(),
                state: AtomicU8::new(LifecycleState::Created.as_u8()),
                counters: Counters::default(),
            }),
        }
    }

    /// Runs the dispatch loop until the cancellation token fires.
    ///
    /// Returns once the broker is [`LifecycleState::Stopped`]. Only the first
    /// call on a broker (across all clones) runs the loop; later calls get
    /// [`BrokerError::AlreadyStarted`].
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut inbound = self.take_inbound()?;
        let shared = &self.shared;

        shared.set_state(LifecycleState::Running);
        info!(
            inbound_capacity = shared.config.inbound_capacity,
            "broker dispatch loop started"
        );

        loop {
            select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                received = inbound.recv() => match received {
                    Some(message) => shared.dispatch(message),
                    // `shared` owns a sender, so the queue cannot close under us.
                    None => break,
                },
            }
        }

        let abandoned = inbound.len();
        drop(inbound);

        shared.set_state(LifecycleState::Stopped);
        shared.stopped.cancel();
        info!(abandoned, "broker stopped");
        Ok(())
    }

    fn take_inbound(&self) -> Result<mpsc::Receiver<Message>, BrokerError> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::AlreadyStarted)
    }

    /// Queues `message` for dispatch.
    ///
    /// Waits while the inbound queue is full. Fails with
    /// [`BrokerError::Closed`] if cancellation fires first, including when it
    /// had already fired before the call.
    pub async fn send_message(&self, message: Message) -> Result<(), BrokerError> {
        let shared = &self.shared;
        select! {
            biased;
            _ = shared.cancel.cancelled() => Err(BrokerError::Closed),
            sent = shared.inbound.send(message) => sent.map_err(|_| BrokerError::Closed),
        }
    }

    /// Associates `id` with `outbox`, silently replacing any previous channel.
    pub fn register_user(&self, id: impl Into<String>, outbox: Outbox) {
        let id = id.into();
        if self.shared.registry.register(id.clone(), outbox).is_some() {
            debug!(subscriber = %id, "subscriber re-registered; previous outbox superseded");
        } else {
            debug!(subscriber = %id, "subscriber registered");
        }
    }

    /// Registers `outbox` under `id` unless the identity is already taken.
    pub fn claim_user(&self, id: impl Into<String>, outbox: Outbox) -> Result<(), BrokerError> {
        let id = id.into();
        if self.shared.registry.claim(id.clone(), outbox) {
            debug!(subscriber = %id, "subscriber registered");
            Ok(())
        } else {
            Err(BrokerError::IdentityTaken { id })
        }
    }

    /// Removes `id` from the registry. Unknown identities are ignored.
    pub fn unregister_user(&self, id: &str) {
        if self.shared.registry.unregister(id).is_some() {
            debug!(subscriber = %id, "subscriber unregistered");
        }
    }

    /// Removes `id` only if it is still registered with `outbox`.
    ///
    /// Lets a session clean up after itself without evicting a newer
    /// registration under the same identity.
    pub fn unregister_user_if_current(&self, id: &str, outbox: &Outbox) -> bool {
        let removed = self.shared.registry.unregister_if_current(id, outbox);
        if removed {
            debug!(subscriber = %id, "subscriber unregistered");
        }
        removed
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.shared.registry.contains(id)
    }

    /// Sorted identities currently registered.
    pub fn registered_users(&self) -> Vec<String> {
        self.shared.registry.ids()
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.counters.snapshot()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True once the cancellation token has fired.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Completes when the cancellation token fires.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Completes when the dispatch loop has exited.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }
}

impl Shared {
    fn set_state(&self, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn dispatch(&self, message: Message) {
        if self.cancel.is_cancelled() {
            return;
        }
        Counters::bump(&self.counters.dispatched);

        if message.broadcast {
            self.fan_out(message);
        } else {
            self.route(message);
        }
    }

    fn fan_out(&self, message: Message) {
        let subscribers = self.registry.snapshot();
        trace!(
            sender = %message.sender,
            subscribers = subscribers.len(),
            "broadcasting message"
        );

        for (id, outbox) in subscribers {
            if self.cancel.is_cancelled() {
                break;
            }
            self.deliver(&id, &outbox, message.clone());
        }
    }

    fn route(&self, message: Message) {
        let recipient = message.recipient.clone();
        match self.registry.lookup(&recipient) {
            Some(outbox) => self.deliver(&recipient, &outbox, message),
            None => {
                Counters::bump(&self.counters.dropped_unroutable);
                debug!(
                    sender = %message.sender,
                    recipient = %recipient,
                    "recipient not registered; message discarded"
                );
            }
        }
    }

    fn deliver(&self, id: &str, outbox: &Outbox, message: Message) {
        match outbox.try_send(message) {
            Ok(()) => Counters::bump(&self.counters.delivered),
            Err(TrySendError::Full(_)) => {
                Counters::bump(&self.counters.dropped_full);
                debug!(subscriber = %id, "subscriber outbox full; message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                Counters::bump(&self.counters.dropped_closed);
                trace!(subscriber = %id, "subscriber outbox closed; message dropped");
            }
        }
    }
}
