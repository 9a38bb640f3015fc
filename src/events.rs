//! Structured bridge events and the sink they are delivered to.
//!
//! Every discard, transition and fault inside the bridge produces one
//! [`BridgeEvent`]. Front ends inject an [`EventSink`] to observe them; the
//! default [`TracingSink`] turns each event into a `tracing` record.

use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::types::{ConnectionState, LinkId};

/// Something worth observing happened inside the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A supervisor moved its link to a new state
    StateTransition { link: LinkId, from: ConnectionState, to: ConnectionState, generation: u64 },

    /// A connect attempt failed; the next one follows after `retry_in`
    ConnectFailed { link: LinkId, attempt: u32, retry_in: Duration, error: String },

    /// An inbound message was discarded
    DecodeFailed { link: LinkId, kind: &'static str, details: String },

    /// A transport operation failed and was reported to the supervisor
    TransportFailed { link: LinkId, error: String },

    /// The governor skipped intermediate frames to stay on the newest one
    FramesCoalesced { skipped: u32, emitted_sequence: u32 },

    /// Robot telemetry echoed a sequence further ahead than expected
    RobotGap { missing: u32, sequence_echoed: u32 },

    /// Axis count of a peer disagrees with the configured robot
    ArityFault { link: LinkId, expected: usize, found: usize },

    /// A frame was not delivered because the robot link was down
    FrameDropped { sequence: u32, state: ConnectionState },

    /// Sending a frame or acknowledgement failed
    SendFailed { link: LinkId, sequence: u32, error: String },

    /// Difference between a commanded and an echoed pose
    Drift { sequence: u32, max_abs: f64 },
}

impl BridgeEvent {
    /// The link the event concerns, if any.
    pub fn link(&self) -> Option<LinkId> {
        match self {
            BridgeEvent::StateTransition { link, .. }
            | BridgeEvent::ConnectFailed { link, .. }
            | BridgeEvent::DecodeFailed { link, .. }
            | BridgeEvent::TransportFailed { link, .. }
            | BridgeEvent::ArityFault { link, .. }
            | BridgeEvent::SendFailed { link, .. } => Some(*link),
            BridgeEvent::FramesCoalesced { .. }
            | BridgeEvent::RobotGap { .. }
            | BridgeEvent::FrameDropped { .. }
            | BridgeEvent::Drift { .. } => Some(LinkId::Robot),
        }
    }
}

/// Receiver of bridge events.
///
/// `emit` is called inline from the bridge's hot loops and must not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: BridgeEvent);
}

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::StateTransition { link, from, to, generation } => {
                if to.is_up() || from == ConnectionState::Disconnected {
                    info!(%link, %from, %to, generation, "Link state changed");
                } else {
                    warn!(%link, %from, %to, generation, "Link state changed");
                }
            }
            BridgeEvent::ConnectFailed { link, attempt, retry_in, error } => {
                warn!(%link, attempt, retry_in_ms = retry_in.as_millis() as u64, %error, "Connect failed");
            }
            BridgeEvent::DecodeFailed { link, kind, details } => {
                debug!(%link, kind, %details, "Discarded inbound message");
            }
            BridgeEvent::TransportFailed { link, error } => {
                warn!(%link, %error, "Transport failure");
            }
            BridgeEvent::FramesCoalesced { skipped, emitted_sequence } => {
                trace!(skipped, emitted_sequence, "Frames coalesced");
            }
            BridgeEvent::RobotGap { missing, sequence_echoed } => {
                debug!(missing, sequence_echoed, "Gap in robot telemetry");
            }
            BridgeEvent::ArityFault { link, expected, found } => {
                warn!(%link, expected, found, "Axis count mismatch; check axis_count");
            }
            BridgeEvent::FrameDropped { sequence, state } => {
                trace!(sequence, %state, "Frame dropped while robot link is down");
            }
            BridgeEvent::SendFailed { link, sequence, error } => {
                warn!(%link, sequence, %error, "Send failed");
            }
            BridgeEvent::Drift { sequence, max_abs } => {
                trace!(sequence, max_abs, "Pose drift");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_name_their_link() {
        let transition = BridgeEvent::StateTransition {
            link: LinkId::Animation,
            from: ConnectionState::Connecting,
            to: ConnectionState::Connected,
            generation: 1,
        };
        assert_eq!(transition.link(), Some(LinkId::Animation));
        assert_eq!(BridgeEvent::Drift { sequence: 3, max_abs: 0.5 }.link(), Some(LinkId::Robot));
    }

    #[test]
    fn tracing_sink_accepts_every_event() {
        let sink = TracingSink;
        let events = vec![
            BridgeEvent::StateTransition {
                link: LinkId::Robot,
                from: ConnectionState::Connected,
                to: ConnectionState::Degraded,
                generation: 2,
            },
            BridgeEvent::ConnectFailed {
                link: LinkId::Robot,
                attempt: 3,
                retry_in: Duration::from_millis(400),
                error: "refused".into(),
            },
            BridgeEvent::DecodeFailed { link: LinkId::Animation, kind: "malformed", details: "x".into() },
            BridgeEvent::TransportFailed { link: LinkId::Animation, error: "reset".into() },
            BridgeEvent::FramesCoalesced { skipped: 4, emitted_sequence: 9 },
            BridgeEvent::RobotGap { missing: 1, sequence_echoed: 7 },
            BridgeEvent::ArityFault { link: LinkId::Animation, expected: 6, found: 3 },
            BridgeEvent::FrameDropped { sequence: 1, state: ConnectionState::Connecting },
            BridgeEvent::SendFailed { link: LinkId::Robot, sequence: 1, error: "pipe".into() },
            BridgeEvent::Drift { sequence: 1, max_abs: 0.01 },
        ];
        for event in events {
            sink.emit(event);
        }
    }
}
