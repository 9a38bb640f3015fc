//! Rate governor: paces frames towards the robot at its control period.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior, interval};

use crate::config::IdlePolicy;
use crate::types::{MotionFrame, sequence_after, sequence_gap};

/// Single-slot, latest-value-wins frame buffer.
///
/// Publishing never blocks and replaces any frame the governor has not
/// emitted yet. Dropping the slot ends every governor created from it.
#[derive(Debug)]
pub struct FrameSlot {
    tx: watch::Sender<Option<MotionFrame>>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self { tx: watch::Sender::new(None) }
    }

    /// Store `frame` as the newest frame.
    pub fn publish(&self, frame: MotionFrame) {
        self.tx.send_replace(Some(frame));
    }

    /// Sequence of the most recently published frame.
    pub fn latest_sequence(&self) -> Option<u32> {
        self.tx.borrow().as_ref().map(|f| f.sequence)
    }

    /// Governor ticking every `period`.
    ///
    /// Must be called within a tokio runtime.
    pub fn governor(&self, period: Duration, policy: IdlePolicy) -> RateGovernor {
        RateGovernor::new(self.tx.subscribe(), period, policy)
    }
}

/// One governor output.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// A frame newer than anything emitted before; `coalesced` intermediate
    /// sequences were never emitted
    Fresh { frame: MotionFrame, coalesced: u32 },
    /// The previous frame again, because nothing newer arrived
    Held(MotionFrame),
}

impl Emission {
    pub fn frame(&self) -> &MotionFrame {
        match self {
            Emission::Fresh { frame, .. } | Emission::Held(frame) => frame,
        }
    }

    pub fn into_frame(self) -> MotionFrame {
        match self {
            Emission::Fresh { frame, .. } | Emission::Held(frame) => frame,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Emission::Fresh { .. })
    }
}

/// Running totals of a governor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorStats {
    pub fresh: u64,
    pub held: u64,
    /// Ticks that emitted nothing
    pub idle_ticks: u64,
    /// Sequences overwritten before they could be emitted
    pub coalesced: u64,
}

/// Tick decision logic, separated from timing.
#[derive(Debug, Clone)]
pub struct Pacer {
    policy: IdlePolicy,
    last: Option<MotionFrame>,
    baseline: Option<u32>,
    stats: GovernorStats,
}

impl Pacer {
    pub fn new(policy: IdlePolicy) -> Self {
        Self { policy, last: None, baseline: None, stats: GovernorStats::default() }
    }

    /// Treat `sequence` as already emitted, so frames overwritten before the
    /// first fresh emission are counted as coalesced.
    pub fn with_baseline(mut self, sequence: u32) -> Self {
        self.baseline = Some(sequence);
        self
    }

    /// Decide what one tick emits given the newest published frame.
    pub fn on_tick(&mut self, newest: Option<&MotionFrame>) -> Option<Emission> {
        let previous = self.last_sequence().or(self.baseline);
        let fresh = match (newest, previous) {
            (Some(frame), None) => Some((frame, 0)),
            (Some(frame), Some(previous)) if sequence_after(frame.sequence, previous) => {
                Some((frame, sequence_gap(previous, frame.sequence)))
            }
            _ => None,
        };

        if let Some((frame, coalesced)) = fresh {
            self.stats.fresh += 1;
            self.stats.coalesced += u64::from(coalesced);
            self.last = Some(frame.clone());
            return Some(Emission::Fresh { frame: frame.clone(), coalesced });
        }

        match (self.policy, &self.last) {
            (IdlePolicy::Hold, Some(last)) => {
                self.stats.held += 1;
                Some(Emission::Held(last.clone()))
            }
            _ => {
                self.stats.idle_ticks += 1;
                None
            }
        }
    }

    pub fn stats(&self) -> GovernorStats {
        self.stats
    }

    /// Sequence of the last fresh emission.
    pub fn last_sequence(&self) -> Option<u32> {
        self.last.as_ref().map(|f| f.sequence)
    }
}

/// A [`Stream`] of [`Emission`]s, one decision per tick.
///
/// Missed ticks are delayed rather than burst. The stream ends once the
/// [`FrameSlot`] is dropped and no unsent frame remains.
pub struct RateGovernor {
    frames: watch::Receiver<Option<MotionFrame>>,
    interval: Interval,
    pacer: Pacer,
}

impl RateGovernor {
    fn new(frames: watch::Receiver<Option<MotionFrame>>, period: Duration, policy: IdlePolicy) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { frames, interval, pacer: Pacer::new(policy) }
    }

    /// See [`Pacer::with_baseline`].
    pub fn with_baseline(mut self, sequence: u32) -> Self {
        self.pacer = self.pacer.with_baseline(sequence);
        self
    }

    pub fn stats(&self) -> GovernorStats {
        self.pacer.stats()
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

impl Stream for RateGovernor {
    type Item = Emission;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.interval.poll_tick(cx).is_pending() {
                return Poll::Pending;
            }

            let closed = this.frames.has_changed().is_err();
            let emission = {
                let newest = this.frames.borrow_and_update();
                this.pacer.on_tick(newest.as_ref())
            };

            match emission {
                Some(emission @ Emission::Fresh { .. }) => return Poll::Ready(Some(emission)),
                _ if closed => return Poll::Ready(None),
                Some(held) => return Poll::Ready(Some(held)),
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceId;
    use futures::StreamExt;
    use std::time::SystemTime;

    fn frame(sequence: u32) -> MotionFrame {
        MotionFrame::new(sequence, SystemTime::now(), vec![sequence as f64; 3], SourceId::default())
    }

    #[test]
    fn pacer_emits_newest_and_counts_coalesced() {
        let mut pacer = Pacer::new(IdlePolicy::Skip);
        assert_eq!(pacer.on_tick(None), None);

        let first = pacer.on_tick(Some(&frame(1))).unwrap();
        assert!(matches!(&first, Emission::Fresh { frame, coalesced: 0 } if frame.sequence == 1));

        let jump = pacer.on_tick(Some(&frame(5))).unwrap();
        assert!(matches!(jump, Emission::Fresh { coalesced: 3, .. }));
        assert_eq!(pacer.on_tick(Some(&frame(5))), None);

        let stats = pacer.stats();
        assert_eq!((stats.fresh, stats.held, stats.idle_ticks, stats.coalesced), (2, 0, 2, 3));
    }

    #[test]
    fn pacer_counts_frames_overwritten_before_first_tick() {
        let mut pacer = Pacer::new(IdlePolicy::Hold).with_baseline(0);
        assert_eq!(pacer.on_tick(None), None);

        let first = pacer.on_tick(Some(&frame(4))).unwrap();
        assert!(matches!(first, Emission::Fresh { coalesced: 3, .. }));
        assert!(!pacer.on_tick(Some(&frame(4))).unwrap().is_fresh());
        assert_eq!(pacer.stats().coalesced, 3);

        // a stale frame at or before the baseline is never emitted
        let mut pacer = Pacer::new(IdlePolicy::Skip).with_baseline(10);
        assert_eq!(pacer.on_tick(Some(&frame(10))), None);
    }

    #[test]
    fn pacer_hold_repeats_last_frame() {
        let mut pacer = Pacer::new(IdlePolicy::Hold);
        assert_eq!(pacer.on_tick(None), None);
        pacer.on_tick(Some(&frame(7))).unwrap();

        let held = pacer.on_tick(Some(&frame(7))).unwrap();
        assert!(!held.is_fresh());
        assert_eq!(held.frame().sequence, 7);
        assert_eq!(pacer.stats().held, 1);
    }

    #[test]
    fn pacer_never_goes_backwards() {
        let mut pacer = Pacer::new(IdlePolicy::Skip);
        pacer.on_tick(Some(&frame(10)));
        assert_eq!(pacer.on_tick(Some(&frame(9))), None);
        assert_eq!(pacer.last_sequence(), Some(10));
    }

    #[test]
    fn pacer_follows_wraparound() {
        let mut pacer = Pacer::new(IdlePolicy::Skip);
        pacer.on_tick(Some(&frame(u32::MAX - 1)));
        let next = pacer.on_tick(Some(&frame(1))).unwrap();
        assert!(matches!(next, Emission::Fresh { coalesced: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn latest_value_wins_under_overload() {
        let period = Duration::from_millis(12);
        let slot = FrameSlot::new();
        let mut governor = slot.governor(period, IdlePolicy::Skip).with_baseline(0);

        let publisher = tokio::spawn(async move {
            for sequence in 1..=100 {
                slot.publish(frame(sequence));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let mut sequences = Vec::new();
        let mut coalesced = 0u64;
        while let Some(emission) = governor.next().await {
            if let Emission::Fresh { frame, coalesced: skipped } = emission {
                sequences.push(frame.sequence);
                coalesced += u64::from(skipped);
            }
        }
        publisher.await.unwrap();

        assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{sequences:?}");
        assert_eq!(sequences.last(), Some(&100));
        // 100 frames over ~100ms at a 12ms tick
        assert!(sequences.len() <= 10, "{sequences:?}");
        // every published frame is either emitted or counted as coalesced
        assert_eq!(sequences.len() as u64 + coalesced, 100);

        let stats = governor.stats();
        assert_eq!(stats.fresh, sequences.len() as u64);
        assert_eq!(stats.coalesced, coalesced);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_policy_repeats_each_tick() {
        let slot = FrameSlot::new();
        let mut governor = slot.governor(Duration::from_millis(12), IdlePolicy::Hold);
        slot.publish(frame(1));

        let start = tokio::time::Instant::now();
        let emissions: Vec<_> = (&mut governor).take(3).collect().await;
        assert!(emissions[0].is_fresh());
        assert_eq!(emissions[1], Emission::Held(emissions[0].frame().clone()));
        assert_eq!(emissions[2].frame().sequence, 1);
        assert!(start.elapsed() >= Duration::from_millis(24));

        slot.publish(frame(2));
        assert!(governor.next().await.unwrap().is_fresh());
        drop(slot);
        assert_eq!(governor.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_stays_silent_until_slot_dropped() {
        let slot = FrameSlot::new();
        let mut governor = slot.governor(Duration::from_millis(12), IdlePolicy::Skip);
        slot.publish(frame(4));
        assert_eq!(governor.next().await.map(|e| e.frame().sequence), Some(4));
        assert_eq!(slot.latest_sequence(), Some(4));

        let waited = tokio::time::timeout(Duration::from_millis(100), governor.next()).await;
        assert!(waited.is_err());
        assert!(governor.stats().idle_ticks >= 8);

        drop(slot);
        assert_eq!(governor.next().await, None);
    }
}
