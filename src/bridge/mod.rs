//! Bridge orchestrator: wires codecs, transports, supervisors and the governor.
//!
//! [`Bridge::start`] spawns six tasks, seven with a keepalive configured:
//!
//! - one [`Supervisor`] per link
//! - the animation loop: receive → decode → [`FrameSlot::publish`]
//! - the send loop: governor tick → encode → robot transport
//! - the robot loop: receive → decode telemetry → session (and optional ack)
//! - a mirror of both link states into the session stream
//! - the keepalive loop: a comment line after the animation link idles
//!
//! Every loop observes one [`CancellationToken`] at its blocking point. A send
//! that is already in progress is allowed to finish.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{AnimationDecoder, decode_telemetry, encode_animation_ack, encode_keepalive, encode_robot_packet};
use crate::config::BridgeConfig;
use crate::error::{DecodeError, ReceiveError, Result};
use crate::events::{BridgeEvent, EventSink};
use crate::session::{ArityFault, SessionHandle, SessionRecorder};
use crate::stream::{Emission, FrameSlot, RateGovernor};
use crate::supervisor::{ActivityClock, LinkHandle, Supervisor};
use crate::transport::Transport;
use crate::types::{LinkId, LinkStatus, SourceId, Telemetry, sequence_after, sequence_gap};


/// Entry point for running a bridge over caller-supplied transports.
pub struct Bridge;

impl Bridge {
    /// Validate `config` and start all bridge tasks.
    ///
    /// Must be called from within a tokio runtime. The transports should be
    /// disconnected; the supervisors connect them.
    pub fn start(
        config: BridgeConfig,
        animation: Arc<dyn Transport>,
        robot: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
    ) -> Result<BridgeHandle> {
        config.validate()?;
        info!(
            axis_count = config.axis_count,
            animation = %config.animation.address,
            robot = %config.robot.address,
            robot_transport = robot.kind(),
            tick_ms = config.governor.tick_interval_ms,
            "Starting bridge"
        );

        let cancel = CancellationToken::new();
        let (animation_supervisor, animation_link) = Supervisor::new(
            LinkId::Animation,
            animation.clone(),
            config.animation.address.clone(),
            &config.animation.link,
            config.animation.liveness.as_ref(),
            sink.clone(),
        );
        let (robot_supervisor, robot_link) = Supervisor::new(
            LinkId::Robot,
            robot.clone(),
            config.robot.address.clone(),
            &config.robot.link,
            config.robot.liveness.as_ref(),
            sink.clone(),
        );

        let recorder = SessionRecorder::new();
        let session = recorder.handle(animation_link.subscribe(), robot_link.subscribe());
        let decoder = AnimationDecoder::new(config.axis_count, SourceId::new(config.animation.source_id.clone()));
        let slot = FrameSlot::new();
        let governor = slot
            .governor(config.governor.tick_interval(), config.governor.idle_policy)
            .with_baseline(decoder.next_sequence().wrapping_sub(1));
        let outbound = Arc::new(ActivityClock::new());

        let animation_loop = AnimationLoop {
            link: animation_link.clone(),
            decoder,
            slot,
            recorder: recorder.clone(),
            sink: sink.clone(),
        };
        let send_loop = SendLoop { link: robot_link.clone(), recorder: recorder.clone(), sink: sink.clone() };
        let robot_loop = RobotLoop {
            link: robot_link.clone(),
            animation: animation_link.clone(),
            axis_count: config.axis_count,
            echo_telemetry: config.echo_telemetry,
            last_echoed: None,
            outbound: outbound.clone(),
            recorder: recorder.clone(),
            sink: sink.clone(),
        };

        let mut tasks = vec![
            tokio::spawn(animation_supervisor.run(cancel.clone())),
            tokio::spawn(robot_supervisor.run(cancel.clone())),
            tokio::spawn(animation_loop.run(cancel.clone())),
            tokio::spawn(send_loop.run(governor, cancel.clone())),
            tokio::spawn(robot_loop.run(cancel.clone())),
            tokio::spawn(mirror_link_status(
                recorder.clone(),
                animation_link.subscribe(),
                robot_link.subscribe(),
                cancel.clone(),
            )),
        ];
        if let Some(period) = config.animation.keepalive() {
            let keepalive_loop = KeepaliveLoop { link: animation_link, period, outbound, recorder, sink };
            tasks.push(tokio::spawn(keepalive_loop.run(cancel.clone())));
        }

        Ok(BridgeHandle { cancel, tasks, session, animation, robot })
    }
}

/// Handle to a running bridge.
///
/// Dropping the handle cancels every bridge task; [`shutdown`](Self::shutdown)
/// additionally waits for them and closes both transports.
pub struct BridgeHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    session: SessionHandle,
    animation: Arc<dyn Transport>,
    robot: Arc<dyn Transport>,
}

impl BridgeHandle {
    /// Reader for session snapshots.
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop all loops, wait for them, then close both transports.
    pub async fn shutdown(mut self) {
        info!("Shutting down bridge");
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }
        self.animation.close().await;
        self.robot.close().await;

        let counters = self.session.snapshot().counters;
        info!(
            frames_received = counters.frames_received,
            frames_sent = counters.frames_sent,
            decode_errors = counters.decode_errors,
            "Bridge stopped"
        );
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct AnimationLoop {
    link: LinkHandle,
    decoder: AnimationDecoder,
    slot: FrameSlot,
    recorder: SessionRecorder,
    sink: Arc<dyn EventSink>,
}

impl AnimationLoop {
    async fn run(mut self, cancel: CancellationToken) {
        debug!("Animation loop started");
        let mut generation = 0;

        'connections: loop {
            generation = tokio::select! {
                _ = cancel.cancelled() => break,
                up = self.link.wait_until_up(generation) => match up {
                    Some(generation) => generation,
                    None => break,
                },
            };

            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break 'connections,
                    received = self.link.transport().receive() => received,
                };

                match received {
                    Ok(line) => {
                        self.link.record_traffic();
                        self.on_line(&line);
                    }
                    Err(ReceiveError::Timeout { .. }) => {
                        if !is_current(self.link.status(), generation) {
                            continue 'connections;
                        }
                    }
                    Err(ReceiveError::Malformed { details }) => {
                        self.link.record_traffic();
                        self.recorder.update(|s| s.counters.decode_errors += 1);
                        self.sink.emit(BridgeEvent::DecodeFailed { link: LinkId::Animation, kind: "malformed", details });
                    }
                    Err(e) => {
                        self.link.report_fault(generation, e.to_string());
                        continue 'connections;
                    }
                }
            }
        }

        debug!("Animation loop stopped");
    }

    fn on_line(&mut self, line: &[u8]) {
        match self.decoder.decode_animation_message(line, SystemTime::now()) {
            Ok(Some(frame)) => {
                trace!(sequence = frame.sequence, "Frame received");
                self.slot.publish(frame);
                self.recorder.update(|s| s.counters.frames_received += 1);
            }
            Ok(None) => {}
            Err(error) => {
                if let DecodeError::ArityMismatch { expected, found } = error {
                    record_arity_fault(&self.recorder, &*self.sink, LinkId::Animation, expected, found);
                }
                self.recorder.update(|s| s.counters.decode_errors += 1);
                self.sink.emit(BridgeEvent::DecodeFailed {
                    link: LinkId::Animation,
                    kind: error.kind(),
                    details: error.to_string(),
                });
            }
        }
    }
}

struct SendLoop {
    link: LinkHandle,
    recorder: SessionRecorder,
    sink: Arc<dyn EventSink>,
}

impl SendLoop {
    async fn run(self, mut governor: RateGovernor, cancel: CancellationToken) {
        debug!(period_ms = governor.period().as_millis() as u64, "Send loop started");

        loop {
            let emission = tokio::select! {
                _ = cancel.cancelled() => break,
                emission = governor.next() => match emission {
                    Some(emission) => emission,
                    None => break,
                },
            };
            self.deliver(emission).await;
        }

        let stats = governor.stats();
        debug!(fresh = stats.fresh, held = stats.held, coalesced = stats.coalesced, "Send loop stopped");
    }

    async fn deliver(&self, emission: Emission) {
        let held = !emission.is_fresh();
        if let Emission::Fresh { coalesced, frame } = &emission {
            if *coalesced > 0 {
                let coalesced = *coalesced;
                self.recorder.update(|s| s.counters.frames_coalesced += u64::from(coalesced));
                self.sink.emit(BridgeEvent::FramesCoalesced { skipped: coalesced, emitted_sequence: frame.sequence });
            }
        }
        let frame = emission.into_frame();

        let status = self.link.status();
        if !status.is_up() {
            self.recorder.update(|s| s.counters.dropped_link_down += 1);
            self.sink.emit(BridgeEvent::FrameDropped { sequence: frame.sequence, state: status.state });
            return;
        }

        let packet = encode_robot_packet(&frame);
        match self.link.transport().send(packet.into_bytes()).await {
            Ok(()) => {
                trace!(sequence = frame.sequence, held, "Frame sent");
                self.recorder.update(|s| {
                    s.counters.frames_sent += 1;
                    if held {
                        s.counters.frames_held += 1;
                    }
                    s.last_frame = Some(frame);
                });
            }
            Err(e) => {
                self.recorder.update(|s| s.counters.send_failures += 1);
                self.sink.emit(BridgeEvent::SendFailed {
                    link: LinkId::Robot,
                    sequence: frame.sequence,
                    error: e.to_string(),
                });
                self.link.report_fault(status.generation, e.to_string());
            }
        }
    }
}

struct RobotLoop {
    link: LinkHandle,
    animation: LinkHandle,
    axis_count: usize,
    echo_telemetry: bool,
    last_echoed: Option<u32>,
    outbound: Arc<ActivityClock>,
    recorder: SessionRecorder,
    sink: Arc<dyn EventSink>,
}

impl RobotLoop {
    async fn run(mut self, cancel: CancellationToken) {
        debug!(echo = self.echo_telemetry, "Robot loop started");
        let mut generation = 0;

        'connections: loop {
            generation = tokio::select! {
                _ = cancel.cancelled() => break,
                up = self.link.wait_until_up(generation) => match up {
                    Some(generation) => generation,
                    None => break,
                },
            };

            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break 'connections,
                    received = self.link.transport().receive() => received,
                };

                match received {
                    Ok(packet) => {
                        self.link.record_traffic();
                        self.on_packet(&packet).await;
                    }
                    Err(ReceiveError::Timeout { .. }) => {
                        if !is_current(self.link.status(), generation) {
                            continue 'connections;
                        }
                    }
                    Err(ReceiveError::Malformed { details }) => {
                        self.recorder.update(|s| s.counters.decode_errors += 1);
                        self.sink.emit(BridgeEvent::DecodeFailed { link: LinkId::Robot, kind: "malformed", details });
                    }
                    Err(e) => {
                        self.link.report_fault(generation, e.to_string());
                        continue 'connections;
                    }
                }
            }
        }

        debug!("Robot loop stopped");
    }

    async fn on_packet(&mut self, packet: &[u8]) {
        let telemetry = match decode_telemetry(packet) {
            Ok(telemetry) if telemetry.actual_axis_values.len() != self.axis_count => {
                let found = telemetry.actual_axis_values.len();
                record_arity_fault(&self.recorder, &*self.sink, LinkId::Robot, self.axis_count, found);
                Err(DecodeError::ArityMismatch { expected: self.axis_count, found })
            }
            other => other,
        };

        let telemetry = match telemetry {
            Ok(telemetry) => telemetry,
            Err(error) => {
                let checksum = matches!(error, DecodeError::ChecksumMismatch { .. });
                self.recorder.update(|s| {
                    s.counters.decode_errors += 1;
                    if checksum {
                        s.counters.checksum_failures += 1;
                    }
                });
                self.sink.emit(BridgeEvent::DecodeFailed {
                    link: LinkId::Robot,
                    kind: error.kind(),
                    details: error.to_string(),
                });
                return;
            }
        };

        self.record(&telemetry);
        if self.echo_telemetry {
            self.acknowledge(&telemetry).await;
        }
    }

    fn record(&mut self, telemetry: &Telemetry) {
        let echoed = telemetry.sequence_echoed;
        let mut gap = 0;
        match self.last_echoed {
            Some(previous) if sequence_after(echoed, previous) => {
                gap = sequence_gap(previous, echoed);
                self.last_echoed = Some(echoed);
            }
            Some(_) => {}
            None => self.last_echoed = Some(echoed),
        }
        if gap > 0 {
            self.sink.emit(BridgeEvent::RobotGap { missing: gap, sequence_echoed: echoed });
        }

        let drift = self.recorder.read(|s| {
            s.last_frame
                .as_ref()
                .filter(|frame| frame.sequence == echoed)
                .and_then(|frame| telemetry.drift_from(&frame.axis_values))
        });
        if let Some(max_abs) = drift {
            self.sink.emit(BridgeEvent::Drift { sequence: echoed, max_abs });
        }
        if telemetry.status_flags.is_halted() {
            debug!(sequence = echoed, flags = telemetry.status_flags.value(), "Robot reports halt");
        }

        self.recorder.update(|s| {
            s.counters.telemetry_received += 1;
            s.counters.robot_gaps += u64::from(gap);
            s.last_telemetry = Some(telemetry.clone());
            if drift.is_some() {
                s.drift = drift;
            }
        });
    }

    async fn acknowledge(&self, telemetry: &Telemetry) {
        let status = self.animation.status();
        if !status.is_up() {
            trace!(sequence = telemetry.sequence_echoed, state = %status.state, "Animation link down; ack dropped");
            self.recorder.update(|s| s.counters.acks_dropped += 1);
            return;
        }
        match self.animation.transport().send(encode_animation_ack(telemetry)).await {
            Ok(()) => {
                self.outbound.touch();
                self.recorder.update(|s| s.counters.acks_sent += 1);
            }
            Err(e) => {
                self.recorder.update(|s| s.counters.send_failures += 1);
                self.sink.emit(BridgeEvent::SendFailed {
                    link: LinkId::Animation,
                    sequence: telemetry.sequence_echoed,
                    error: e.to_string(),
                });
                self.animation.report_fault(status.generation, e.to_string());
            }
        }
    }
}

/// Writes a comment line whenever the animation link has carried no outbound
/// traffic for `period`, so a half-open connection is noticed by a failed write.
struct KeepaliveLoop {
    link: LinkHandle,
    period: Duration,
    outbound: Arc<ActivityClock>,
    recorder: SessionRecorder,
    sink: Arc<dyn EventSink>,
}

impl KeepaliveLoop {
    async fn run(self, cancel: CancellationToken) {
        debug!(period_ms = self.period.as_millis() as u64, "Keepalive loop started");
        let mut generation = 0;
        let mut count: u32 = 0;

        'connections: loop {
            generation = tokio::select! {
                _ = cancel.cancelled() => break,
                up = self.link.wait_until_up(generation) => match up {
                    Some(generation) => generation,
                    None => break,
                },
            };
            self.outbound.touch();

            loop {
                let due = self.outbound.last() + self.period;
                tokio::select! {
                    _ = cancel.cancelled() => break 'connections,
                    _ = tokio::time::sleep_until(due) => {}
                }
                if !is_current(self.link.status(), generation) {
                    continue 'connections;
                }
                // an ack went out while sleeping
                if Instant::now() < self.outbound.last() + self.period {
                    continue;
                }

                count = count.wrapping_add(1);
                match self.link.transport().send(encode_keepalive(count)).await {
                    Ok(()) => {
                        trace!(count, "Keepalive sent");
                        self.outbound.touch();
                        self.recorder.update(|s| s.counters.keepalives_sent += 1);
                    }
                    Err(e) => {
                        self.recorder.update(|s| s.counters.send_failures += 1);
                        self.sink.emit(BridgeEvent::SendFailed {
                            link: LinkId::Animation,
                            sequence: count,
                            error: e.to_string(),
                        });
                        self.link.report_fault(generation, e.to_string());
                        continue 'connections;
                    }
                }
            }
        }

        debug!(sent = count, "Keepalive loop stopped");
    }
}

/// Whether `status` still refers to the live connection `generation`.
fn is_current(status: LinkStatus, generation: u64) -> bool {
    status.is_up() && status.generation == generation
}

/// Count an arity rejection; the first one across both links is kept and announced.
fn record_arity_fault(recorder: &SessionRecorder, sink: &dyn EventSink, link: LinkId, expected: usize, found: usize) {
    let mut first = false;
    recorder.update(|s| {
        s.counters.arity_rejections += 1;
        if s.arity_fault.is_none() {
            s.arity_fault = Some(ArityFault { link, expected, found });
            first = true;
        }
    });
    if first {
        sink.emit(BridgeEvent::ArityFault { link, expected, found });
    }
}

/// Copy supervisor status changes into the session so `updates()` sees them.
async fn mirror_link_status(
    recorder: SessionRecorder,
    mut animation: watch::Receiver<LinkStatus>,
    mut robot: watch::Receiver<LinkStatus>,
    cancel: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            _ = cancel.cancelled() => break,
            changed = animation.changed() => changed,
            changed = robot.changed() => changed,
        };
        if changed.is_err() {
            break;
        }
        let animation_status = *animation.borrow_and_update();
        let robot_status = *robot.borrow_and_update();
        recorder.update(|s| {
            s.animation = animation_status;
            s.robot = robot_status;
        });
    }
}
