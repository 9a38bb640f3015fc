//! Per-link connection supervision.
//!
//! Each link gets one [`Supervisor`] task. It is the only writer of the link's
//! [`LinkStatus`]: it connects the transport, backs off between failed attempts,
//! watches inbound traffic for liveness and reacts to faults reported by the
//! bridge loops through their [`LinkHandle`].
//!
//! The transition rules live in [`LinkStateMachine`], which performs no I/O and
//! takes time as an argument so it can be tested directly.
//!
//! ```text
//! Disconnected ──attempt──▶ Connecting ──ok──▶ Connected ◀──traffic──┐
//!      ▲                        │                  │                  │
//!      └────────failed──────────┘                silence ──▶ Degraded ┘
//!      ▲                                           │            │
//!      └───────────── fault / long silence ────────┴────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::{BackoffConfig, LinkSettings, LivenessConfig};
use crate::events::{BridgeEvent, EventSink};
use crate::transport::Transport;
use crate::types::{ConnectionState, LinkId, LinkStatus};

/// Pending fault reports per link; further reports while full are redundant.
const FAULT_CHANNEL_CAPACITY: usize = 8;

/// Floor for the liveness check period.
const MIN_LIVENESS_PERIOD: Duration = Duration::from_millis(10);

/// A state change produced by [`LinkStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Pure connection state machine for one link.
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    link: LinkId,
    status: LinkStatus,
    failures: u32,
    short_lived: u32,
    liveness: Option<(Duration, Duration)>,
}

impl LinkStateMachine {
    pub fn new(link: LinkId, liveness: Option<&LivenessConfig>) -> Self {
        Self {
            link,
            status: LinkStatus::default(),
            failures: 0,
            short_lived: 0,
            liveness: liveness.map(|l| (l.degraded_after(), l.disconnect_after())),
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// Generation of the current (or most recent) connection.
    pub fn generation(&self) -> u64 {
        self.status.generation
    }

    /// Consecutive failed connect attempts.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Consecutive connections that were lost before becoming stable.
    pub fn short_lived(&self) -> u32 {
        self.short_lived
    }

    /// Backoff attempt number for the next retry.
    ///
    /// Counts failed connects on top of connections that dropped early, so a
    /// peer that accepts and immediately resets is paced like a refusing one.
    pub fn retry_attempt(&self) -> u32 {
        self.short_lived.saturating_add(self.failures).max(1)
    }

    fn move_to(&mut self, to: ConnectionState) -> Option<Transition> {
        let from = self.status.state;
        if from == to {
            return None;
        }
        self.status.state = to;
        Some(Transition { from, to })
    }

    /// Startup or backoff expiry.
    pub fn on_connect_attempt(&mut self) -> Option<Transition> {
        match self.status.state {
            ConnectionState::Disconnected => self.move_to(ConnectionState::Connecting),
            _ => None,
        }
    }

    /// Connect succeeded; opens a new generation.
    pub fn on_connected(&mut self) -> Option<Transition> {
        if self.status.state != ConnectionState::Connecting {
            return None;
        }
        self.failures = 0;
        self.status.generation += 1;
        self.move_to(ConnectionState::Connected)
    }

    /// Connect failed or timed out.
    pub fn on_connect_failed(&mut self) -> Option<Transition> {
        if self.status.state != ConnectionState::Connecting {
            return None;
        }
        self.failures = self.failures.saturating_add(1);
        self.move_to(ConnectionState::Disconnected)
    }

    /// Re-evaluate liveness given how long the link has been silent.
    ///
    /// Links without liveness thresholds never change state here.
    pub fn on_silence(&mut self, silence: Duration) -> Option<Transition> {
        let (degraded_after, disconnect_after) = self.liveness?;
        match self.status.state {
            ConnectionState::Connected | ConnectionState::Degraded if silence >= disconnect_after => {
                self.move_to(ConnectionState::Disconnected)
            }
            ConnectionState::Connected if silence >= degraded_after => self.move_to(ConnectionState::Degraded),
            ConnectionState::Degraded if silence < degraded_after => self.move_to(ConnectionState::Connected),
            _ => None,
        }
    }

    /// A loop reported a send or receive failure on connection `generation`.
    ///
    /// Reports about an earlier connection are ignored.
    pub fn on_transport_error(&mut self, generation: u64) -> Option<Transition> {
        if generation != self.status.generation || !self.status.is_up() {
            return None;
        }
        self.move_to(ConnectionState::Disconnected)
    }

    /// Account for a lost connection that had been up for `uptime`.
    ///
    /// Only a connection that lasted `stable_after` clears the history of
    /// early drops. Returns the backoff attempt for the reconnect.
    pub fn on_connection_lost(&mut self, uptime: Duration, stable_after: Duration) -> u32 {
        if uptime >= stable_after {
            self.short_lived = 0;
        }
        self.short_lived = self.short_lived.saturating_add(1);
        self.retry_attempt()
    }

    pub fn on_shutdown(&mut self) -> Option<Transition> {
        self.move_to(ConnectionState::Disconnected)
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self { initial, max: max.max(initial), multiplier: multiplier.max(1.0), jitter: jitter.clamp(0.0, 1.0) }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if base >= self.max.as_secs_f64() { self.max } else { Duration::from_secs_f64(base) }
    }

    /// Delay before retry number `attempt`, jittered by a random factor.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = if self.jitter > 0.0 { rand::thread_rng().gen_range(-1.0..=1.0) } else { 0.0 };
        self.jittered(attempt, unit)
    }

    /// Delay before retry number `attempt` for a jitter sample `unit` in [-1, 1].
    ///
    /// The result never exceeds the configured maximum.
    pub fn jittered(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt);
        let offset = base.as_secs_f64() * self.jitter * unit.clamp(-1.0, 1.0);
        if offset == 0.0 {
            return base;
        }
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0)).min(self.max)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Backoff::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
            config.jitter,
        )
    }
}

/// Timestamp of the most recent traffic, shared between tasks without a lock.
///
/// The supervisor uses one for inbound liveness; the bridge uses another for
/// outbound idle time on the animation link.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    base: Instant,
    last_nanos: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self { base: Instant::now(), last_nanos: AtomicU64::new(0) }
    }

    pub(crate) fn touch(&self) {
        let nanos = Instant::now().saturating_duration_since(self.base).as_nanos();
        self.last_nanos.store(u64::try_from(nanos).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn last(&self) -> Instant {
        self.base + Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct LinkFault {
    generation: u64,
    reason: String,
}

/// What the bridge loops hold for one link.
///
/// Cheap to clone. Read access to the link status, the transport, and the two
/// ways to feed the supervisor: traffic notifications and fault reports.
#[derive(Clone)]
pub struct LinkHandle {
    link: LinkId,
    transport: Arc<dyn Transport>,
    status: watch::Receiver<LinkStatus>,
    activity: Arc<ActivityClock>,
    faults: mpsc::Sender<LinkFault>,
}

impl LinkHandle {
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Note that a message arrived; keeps liveness satisfied.
    pub fn record_traffic(&self) {
        self.activity.touch();
    }

    /// Report that connection `generation` failed.
    pub fn report_fault(&self, generation: u64, reason: impl Into<String>) {
        let fault = LinkFault { generation, reason: reason.into() };
        if let Err(mpsc::error::TrySendError::Full(fault)) = self.faults.try_send(fault) {
            trace!(link = %self.link, generation = fault.generation, "Fault queue full; dropping report");
        }
    }

    /// Wait until the link is up on a connection newer than `after_generation`.
    ///
    /// Returns that connection's generation, or `None` once the supervisor is gone.
    pub async fn wait_until_up(&self, after_generation: u64) -> Option<u64> {
        let mut status = self.status.clone();
        let current = status.wait_for(|s| s.is_up() && s.generation > after_generation).await.ok()?;
        Some(current.generation)
    }
}

/// Owns one link's state and drives its transport's connection lifecycle.
pub struct Supervisor {
    machine: LinkStateMachine,
    transport: Arc<dyn Transport>,
    address: String,
    backoff: Backoff,
    connect_timeout: Duration,
    status_tx: watch::Sender<LinkStatus>,
    faults: mpsc::Receiver<LinkFault>,
    activity: Arc<ActivityClock>,
    sink: Arc<dyn EventSink>,
}

impl Supervisor {
    /// Build a supervisor and the handle its loops share.
    pub fn new(
        link: LinkId,
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        settings: &LinkSettings,
        liveness: Option<&LivenessConfig>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, LinkHandle) {
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_CHANNEL_CAPACITY);
        let activity = Arc::new(ActivityClock::new());

        let handle = LinkHandle {
            link,
            transport: transport.clone(),
            status: status_rx,
            activity: activity.clone(),
            faults: fault_tx,
        };
        let supervisor = Self {
            machine: LinkStateMachine::new(link, liveness),
            transport,
            address: address.into(),
            backoff: Backoff::from(&settings.backoff),
            connect_timeout: settings.connect_timeout(),
            status_tx,
            faults: fault_rx,
            activity,
            sink,
        };
        (supervisor, handle)
    }

    fn apply(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        let status = self.machine.status();
        self.status_tx.send_replace(status);
        self.sink.emit(BridgeEvent::StateTransition {
            link: self.machine.link(),
            from,
            to,
            generation: status.generation,
        });
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let link = self.machine.link();
        info!(%link, address = %self.address, transport = self.transport.kind(), "Supervisor started");

        loop {
            let transition = self.machine.on_connect_attempt();
            self.apply(transition);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.connect_timeout, self.transport.connect(&self.address)) => result,
            };

            let error = match attempt {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("connect timed out after {:?}", self.connect_timeout)),
            };

            let delay = match error {
                None => {
                    self.activity.touch();
                    let connected_at = Instant::now();
                    let transition = self.machine.on_connected();
                    self.apply(transition);
                    if self.monitor(&cancel).await {
                        break;
                    }
                    self.transport.close().await;
                    let attempt = self.machine.on_connection_lost(connected_at.elapsed(), self.backoff.max());
                    self.backoff.delay_for_attempt(attempt)
                }
                Some(error) => {
                    let transition = self.machine.on_connect_failed();
                    self.apply(transition);
                    let attempt = self.machine.retry_attempt();
                    let retry_in = self.backoff.delay_for_attempt(attempt);
                    self.sink.emit(BridgeEvent::ConnectFailed { link, attempt, retry_in, error });
                    retry_in
                }
            };

            debug!(%link, delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let transition = self.machine.on_shutdown();
        self.apply(transition);
        info!(%link, "Supervisor stopped");
    }

    /// Watch an established connection. Returns `true` when the supervisor
    /// should stop, `false` when the connection was lost.
    async fn monitor(&mut self, cancel: &CancellationToken) -> bool {
        let link = self.machine.link();
        let mut liveness = self.machine.liveness.map(|(degraded_after, _)| {
            let mut check = tokio::time::interval((degraded_after / 4).max(MIN_LIVENESS_PERIOD));
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            check
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                fault = self.faults.recv() => {
                    let Some(fault) = fault else {
                        debug!(%link, "All link handles dropped");
                        return true;
                    };
                    let transition = self.machine.on_transport_error(fault.generation);
                    if transition.is_some() {
                        self.sink.emit(BridgeEvent::TransportFailed { link, error: fault.reason });
                        self.apply(transition);
                        return false;
                    }
                    trace!(%link, generation = fault.generation, "Ignoring stale fault");
                }
                _ = async {
                    match liveness.as_mut() {
                        Some(check) => { check.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let silence = Instant::now().saturating_duration_since(self.activity.last());
                    let transition = self.machine.on_silence(silence);
                    self.apply(transition);
                    if self.machine.state() == ConnectionState::Disconnected {
                        return false;
                    }
                }
            }
        }
    }
}
