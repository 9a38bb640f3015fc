//! Session state shared with observers.
//!
//! The bridge loops write through a [`SessionRecorder`]; each loop owns a
//! disjoint set of fields. Readers get a [`SessionHandle`] and only ever see
//! immutable [`SessionState`] snapshots, either on demand or as a stream.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::types::{ConnectionState, LinkId, LinkStatus, MotionFrame, Telemetry};

/// Monotonic counters kept for the lifetime of a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeCounters {
    /// Frames decoded from the animation link
    pub frames_received: u64,
    /// Packets written to the robot link, fresh and held
    pub frames_sent: u64,
    /// Of `frames_sent`, repeats under the hold policy
    pub frames_held: u64,
    /// Frames superseded in the slot before they could be sent
    pub frames_coalesced: u64,
    /// Inbound messages discarded on either link
    pub decode_errors: u64,
    pub checksum_failures: u64,
    pub arity_rejections: u64,
    /// Governor emissions discarded while the robot link was down
    pub dropped_link_down: u64,
    pub telemetry_received: u64,
    /// Sequences the robot's echo skipped over
    pub robot_gaps: u64,
    pub acks_sent: u64,
    /// Acks skipped because the animation link was down
    pub acks_dropped: u64,
    /// Idle-time comment lines written to the animation link
    pub keepalives_sent: u64,
    pub send_failures: u64,
}

/// A peer disagrees with the configured axis count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArityFault {
    pub link: LinkId,
    pub expected: usize,
    pub found: usize,
}

/// Snapshot of everything the bridge knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub animation: LinkStatus,
    pub robot: LinkStatus,
    /// Last frame written to the robot
    pub last_frame: Option<MotionFrame>,
    /// Last telemetry accepted from the robot
    pub last_telemetry: Option<Telemetry>,
    pub counters: BridgeCounters,
    /// Largest axis difference between the last echoed frame and its command
    pub drift: Option<f64>,
    /// Set on the first arity mismatch and kept until the bridge stops
    pub arity_fault: Option<ArityFault>,
}

impl SessionState {
    pub fn link(&self, link: LinkId) -> LinkStatus {
        match link {
            LinkId::Animation => self.animation,
            LinkId::Robot => self.robot,
        }
    }
}

/// Write side of the session.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self { tx: Arc::new(watch::Sender::new(SessionState::default())) }
    }

    /// Apply `f` and notify readers.
    pub fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.tx.send_modify(f);
    }

    /// Read a value out of the current state.
    pub fn read<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
        f(&self.tx.borrow())
    }

    /// Reader combining this session with the supervisors' link status.
    pub fn handle(
        &self,
        animation: watch::Receiver<LinkStatus>,
        robot: watch::Receiver<LinkStatus>,
    ) -> SessionHandle {
        SessionHandle { session: self.tx.subscribe(), animation, robot }
    }
}

/// Read side of the session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: watch::Receiver<SessionState>,
    animation: watch::Receiver<LinkStatus>,
    robot: watch::Receiver<LinkStatus>,
}

impl SessionHandle {
    fn overlay(&self, mut state: SessionState) -> SessionState {
        state.animation = *self.animation.borrow();
        state.robot = *self.robot.borrow();
        state
    }

    /// Current state, with link status read straight from the supervisors.
    pub fn snapshot(&self) -> SessionState {
        let state = self.session.borrow().clone();
        self.overlay(state)
    }

    /// Current state of one link.
    pub fn link_state(&self, link: LinkId) -> ConnectionState {
        self.link_status(link).state
    }

    pub fn link_status(&self, link: LinkId) -> LinkStatus {
        match link {
            LinkId::Animation => *self.animation.borrow(),
            LinkId::Robot => *self.robot.borrow(),
        }
    }

    /// Stream of snapshots: the current one immediately, then one per change.
    ///
    /// Intermediate states may be skipped when the reader falls behind.
    pub fn updates(&self) -> impl Stream<Item = SessionState> + 'static {
        let handle = self.clone();
        WatchStream::new(self.session.clone()).map(move |state| handle.overlay(state))
    }

    /// Wait until `predicate` holds for the session.
    ///
    /// Returns `None` if the bridge stopped first.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&SessionState) -> bool) -> Option<SessionState> {
        let mut session = self.session.clone();
        let state = session.wait_for(|s| predicate(&self.overlay(s.clone()))).await.ok()?.clone();
        Some(self.overlay(state))
    }
}
