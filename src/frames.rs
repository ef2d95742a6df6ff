//! Frame health measurement.
//!
//! Correlates native frame-counter snapshots fetched at span start and
//! span end. The two fetches complete in arbitrary order relative to each
//! other and to event finalization, so all state is keyed by span id and
//! parked in expiring maps, never inferred from call order.
//!
//! The end-of-span snapshot is matched to the finalized event by capture
//! timestamp: application code may run more synchronous work between
//! "span end" and serialization, so the event finish time and the fetch
//! time are close but not identical. Snapshots outside the margin of
//! error are dropped rather than reported against the wrong interval.

use crate::bridge::{fetch_frames_bounded, FrameSnapshot, NativeBridge};
use crate::config::TimingConfig;
use crate::event::{measurement, span_data, Measurement, SpanRecord, TransactionEvent};
use crate::expiring::{ExpiringMap, ExpiringMapConfig};
use crate::ids::SpanId;
use crate::time::{Clock, Timestamp};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for frame measurement.
#[derive(Debug, Clone)]
pub struct FramesConfig {
    /// Allowed drift between the end-snapshot capture time and the event
    /// finish time.
    pub margin_of_error: Duration,

    /// Deadline for a single native snapshot fetch.
    pub fetch_deadline: Duration,

    /// How long a start snapshot waits for its span to end.
    pub start_ttl: Duration,

    /// How long an end snapshot waits for event finalization.
    pub end_ttl: Duration,

    /// Sweep interval for both snapshot maps.
    pub cleanup_interval: Duration,
}

impl Default for FramesConfig {
    fn default() -> Self {
        FramesConfig::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for FramesConfig {
    fn from(config: &TimingConfig) -> Self {
        FramesConfig {
            margin_of_error: config.margin_of_error,
            fetch_deadline: config.frames_fetch_deadline,
            start_ttl: config.start_frames_ttl,
            end_ttl: config.end_frames_ttl,
            cleanup_interval: config.cleanup_interval,
        }
    }
}

/// A frame snapshot plus the wall-clock instant it was requested at.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TimedSnapshot {
    frames: FrameSnapshot,
    captured_at: Timestamp,
}

/// Adds `frames_total|slow|frozen` measurements to finalized transactions
/// and per-span frame deltas to every ended span.
pub struct FrameMetrics {
    bridge: Arc<dyn NativeBridge>,
    clock: Arc<dyn Clock>,
    config: FramesConfig,

    /// Snapshot at span start, keyed by span id. Long TTL: bounds memory
    /// when a span never ends.
    start_frames: ExpiringMap<SpanId, FrameSnapshot>,

    /// Snapshot at root-span end plus capture time. Short TTL: only
    /// needed while the owning event is being finalized.
    end_frames: ExpiringMap<SpanId, TimedSnapshot>,

    /// Snapshot at the most recent child-span end. Covers transactions
    /// whose effective end is trimmed to the last child span.
    last_child_end: Mutex<Option<TimedSnapshot>>,
}

impl FrameMetrics {
    pub fn new(
        bridge: Arc<dyn NativeBridge>,
        clock: Arc<dyn Clock>,
        config: FramesConfig,
    ) -> Self {
        let start_frames = ExpiringMap::new(ExpiringMapConfig {
            ttl: config.start_ttl,
            cleanup_interval: config.cleanup_interval,
        });
        let end_frames = ExpiringMap::new(ExpiringMapConfig {
            ttl: config.end_ttl,
            cleanup_interval: config.cleanup_interval,
        });
        FrameMetrics {
            bridge,
            clock,
            config,
            start_frames,
            end_frames,
            last_child_end: Mutex::new(None),
        }
    }

    /// Span lifecycle hook: kick off the start-snapshot fetch.
    ///
    /// The fetch is parked pending in the start map; a failed or timed-out
    /// fetch settles the entry empty, which downstream reads treat as
    /// missing data.
    pub fn on_span_start(&self, span: &SpanRecord) {
        let span_id = span.span_id;
        debug!(
            span = %span_id,
            kind = if span.is_root() { "root" } else { "child" },
            "fetching frames for span start"
        );

        let bridge = self.bridge.clone();
        let deadline = self.config.fetch_deadline;
        self.start_frames.insert_pending(span_id, async move {
            match fetch_frames_bounded(bridge.as_ref(), deadline).await {
                Ok(frames) => Some(frames),
                Err(error) => {
                    debug!(span = %span_id, %error, "failed to fetch start frames");
                    None
                }
            }
        });
    }

    /// Span lifecycle hook: capture the end snapshot.
    ///
    /// Root spans park a timestamped snapshot for event finalization.
    /// Every span additionally gets its own start/end delta attached as
    /// span data when the delta carries signal.
    pub async fn on_span_end(&self, span: &mut SpanRecord) {
        let captured_at = self.clock.now();
        let span_id = span.span_id;

        if !self.start_frames.contains_key(&span_id) {
            // Without start frames there is no delta to compute.
            return;
        }

        if span.is_root() {
            debug!(span = %span_id, "fetching frames for root span end");
            let bridge = self.bridge.clone();
            let deadline = self.config.fetch_deadline;
            self.end_frames.insert_pending(span_id, async move {
                match fetch_frames_bounded(bridge.as_ref(), deadline).await {
                    Ok(frames) => Some(TimedSnapshot {
                        frames,
                        captured_at,
                    }),
                    Err(error) => {
                        debug!(span = %span_id, %error, "failed to fetch end frames");
                        None
                    }
                }
            });
        }

        let start = match self.start_frames.get(&span_id) {
            Some(lookup) => lookup.resolved().await,
            None => None,
        };
        let Some(start) = start else {
            debug!(span = %span_id, "no start frames for ended span, skipping frame data");
            return;
        };

        // Frame counters are cumulative, so each span needs the count at
        // its own end time; a cached value would skew the delta.
        let end = match fetch_frames_bounded(self.bridge.as_ref(), self.config.fetch_deadline).await
        {
            Ok(frames) => frames,
            Err(error) => {
                debug!(span = %span_id, %error, "failed to fetch frames for span data");
                return;
            }
        };

        let delta = end.delta_since(&start);
        if !delta.is_noise() {
            span.set_data(span_data::FRAMES_TOTAL, delta.total);
            span.set_data(span_data::FRAMES_SLOW, delta.slow);
            span.set_data(span_data::FRAMES_FROZEN, delta.frozen);
            debug!(
                span = %span_id,
                total = delta.total,
                slow = delta.slow,
                frozen = delta.frozen,
                "attached frame data to span"
            );
        }

        if !span.is_root() {
            *self.last_child_end.lock().unwrap() = Some(TimedSnapshot {
                frames: end,
                captured_at,
            });
        }
    }

    /// Event pipeline hook: reconcile start and end snapshots into
    /// transaction measurements.
    ///
    /// Missing or stale data leaves the event untouched; flat deltas are
    /// dropped as noise.
    pub async fn process_event(&self, event: &mut TransactionEvent) {
        let span_id = event.trace.span_id;

        let start = match self.start_frames.pop(&span_id) {
            Some(lookup) => lookup.resolved().await,
            None => None,
        };
        let Some(start) = start else {
            warn!(
                transaction = %event.transaction,
                span = %span_id,
                "start frames missing for finalized transaction"
            );
            return;
        };

        let end = match self.end_frames.pop(&span_id) {
            Some(lookup) => lookup.resolved().await,
            None => None,
        };

        let margin = self.config.margin_of_error;
        let final_end = match end {
            Some(end) if end.captured_at.is_close(event.timestamp, margin) => {
                debug!(span = %span_id, "using frames from root span end");
                end.frames
            }
            _ => {
                let last_child = *self.last_child_end.lock().unwrap();
                match last_child {
                    Some(last) if last.captured_at.is_close(event.timestamp, margin) => {
                        debug!(span = %span_id, "using frames from last child span end");
                        last.frames
                    }
                    _ => {
                        warn!(
                            span = %span_id,
                            "frames were captured outside the margin of error, dropping the inaccurate values"
                        );
                        return;
                    }
                }
            }
        };

        let delta = final_end.delta_since(&start);
        if delta.is_noise() {
            debug!(span = %span_id, "flat frame counters, not adding measurements");
            return;
        }

        event.set_measurement(
            measurement::FRAMES_TOTAL,
            Measurement::count(delta.total as f64),
        );
        event.set_measurement(
            measurement::FRAMES_SLOW,
            Measurement::count(delta.slow as f64),
        );
        event.set_measurement(
            measurement::FRAMES_FROZEN,
            Measurement::count(delta.frozen as f64),
        );
        debug!(
            transaction = %event.transaction,
            total = delta.total,
            slow = delta.slow,
            frozen = delta.frozen,
            "added frame measurements"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::bridge::BridgeError;
    use crate::ids::TraceId;
    use crate::time::ManualClock;

    fn root_span(clock: &ManualClock) -> SpanRecord {
        SpanRecord::new(
            TraceId::from_bytes([1; 16]),
            SpanId::from_bytes([2; 8]),
            None,
            "ui.load",
            "Screen",
            clock.now(),
        )
    }

    fn child_span(clock: &ManualClock) -> SpanRecord {
        SpanRecord::new(
            TraceId::from_bytes([1; 16]),
            SpanId::from_bytes([3; 8]),
            Some(SpanId::from_bytes([2; 8])),
            "db.query",
            "child",
            clock.now(),
        )
    }

    fn event_for(span: &SpanRecord, timestamp: Timestamp) -> TransactionEvent {
        TransactionEvent::new(
            "Screen",
            span.trace_id,
            span.span_id,
            span.start_timestamp,
            timestamp,
        )
    }

    fn metrics_with(bridge: &Arc<MockBridge>, clock: &Arc<ManualClock>) -> FrameMetrics {
        FrameMetrics::new(
            bridge.clone() as Arc<dyn NativeBridge>,
            clock.clone() as Arc<dyn Clock>,
            FramesConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_span_delta_measurements() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let mut span = root_span(&clock);

        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        metrics.on_span_start(&span);
        tokio::task::yield_now().await;

        clock.set(Timestamp::from_secs(101.0));
        // One snapshot for the span data, one parked for finalization.
        bridge.queue_frames(Ok(FrameSnapshot::new(200, 40, 15)));
        bridge.queue_frames(Ok(FrameSnapshot::new(200, 40, 15)));
        metrics.on_span_end(&mut span).await;
        tokio::task::yield_now().await;

        // The span itself carries the delta as data.
        assert_eq!(span.data[span_data::FRAMES_TOTAL], serde_json::json!(100));
        assert_eq!(span.data[span_data::FRAMES_SLOW], serde_json::json!(20));
        assert_eq!(span.data[span_data::FRAMES_FROZEN], serde_json::json!(10));

        // Event finalized within the margin of error of the end capture.
        let mut event = event_for(&span, Timestamp::from_secs(101.03));
        metrics.process_event(&mut event).await;

        assert_eq!(
            event.measurements[measurement::FRAMES_TOTAL],
            Measurement::count(100.0)
        );
        assert_eq!(
            event.measurements[measurement::FRAMES_SLOW],
            Measurement::count(20.0)
        );
        assert_eq!(
            event.measurements[measurement::FRAMES_FROZEN],
            Measurement::count(10.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_snapshots_add_nothing() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let mut span = root_span(&clock);

        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        metrics.on_span_start(&span);
        tokio::task::yield_now().await;

        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        metrics.on_span_end(&mut span).await;
        tokio::task::yield_now().await;

        assert!(span.data.is_empty());

        let mut event = event_for(&span, clock.now());
        metrics.process_event(&mut event).await;
        assert!(event.measurements.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_start_frames_passes_event_through() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let span = root_span(&clock);

        // No on_span_start: the start map has nothing for this span.
        let mut event = event_for(&span, clock.now());
        metrics.process_event(&mut event).await;
        assert!(event.measurements.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_fetch_settles_empty() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let span = root_span(&clock);

        bridge.queue_frames(Err(BridgeError::Native("bridge down".into())));
        metrics.on_span_start(&span);
        tokio::task::yield_now().await;

        let mut event = event_for(&span, clock.now());
        metrics.process_event(&mut event).await;
        assert!(event.measurements.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_end_frames_dropped() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let mut span = root_span(&clock);

        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        metrics.on_span_start(&span);
        tokio::task::yield_now().await;

        clock.set(Timestamp::from_secs(101.0));
        bridge.queue_frames(Ok(FrameSnapshot::new(200, 40, 15)));
        bridge.queue_frames(Ok(FrameSnapshot::new(200, 40, 15)));
        metrics.on_span_end(&mut span).await;
        tokio::task::yield_now().await;

        // Event finish is 200ms away from the capture: outside the 50ms
        // margin, so no measurement may be guessed.
        let mut event = event_for(&span, Timestamp::from_secs(101.2));
        metrics.process_event(&mut event).await;
        assert!(event.measurements.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trimmed_transaction_uses_last_child_end() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let mut root = root_span(&clock);
        let mut child = child_span(&clock);

        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        metrics.on_span_start(&root);
        tokio::task::yield_now().await;
        bridge.queue_frames(Ok(FrameSnapshot::new(110, 21, 5)));
        metrics.on_span_start(&child);
        tokio::task::yield_now().await;

        // Child ends at 101.0; its end snapshot becomes the fallback.
        clock.set(Timestamp::from_secs(101.0));
        bridge.queue_frames(Ok(FrameSnapshot::new(180, 35, 9)));
        metrics.on_span_end(&mut child).await;
        tokio::task::yield_now().await;

        // Root ends much later; its end capture will not match the
        // trimmed event finish.
        clock.set(Timestamp::from_secs(105.0));
        bridge.queue_frames(Ok(FrameSnapshot::new(300, 60, 20)));
        bridge.queue_frames(Ok(FrameSnapshot::new(300, 60, 20)));
        metrics.on_span_end(&mut root).await;
        tokio::task::yield_now().await;

        // The tracing engine trimmed the event end to the child's end.
        let mut event = event_for(&root, Timestamp::from_secs(101.0));
        metrics.process_event(&mut event).await;

        assert_eq!(
            event.measurements[measurement::FRAMES_TOTAL],
            Measurement::count(80.0)
        );
        assert_eq!(
            event.measurements[measurement::FRAMES_SLOW],
            Measurement::count(15.0)
        );
        assert_eq!(
            event.measurements[measurement::FRAMES_FROZEN],
            Measurement::count(4.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_span_end_skipped_without_start() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let mut child = child_span(&clock);

        metrics.on_span_end(&mut child).await;
        assert!(child.data.is_empty());
        // No fetch was issued at all.
        assert_eq!(bridge.frames_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_frames_consumed_once() {
        let bridge = Arc::new(MockBridge::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
        let metrics = metrics_with(&bridge, &clock);
        let mut span = root_span(&clock);

        bridge.queue_frames(Ok(FrameSnapshot::new(100, 20, 5)));
        metrics.on_span_start(&span);
        tokio::task::yield_now().await;

        bridge.queue_frames(Ok(FrameSnapshot::new(150, 30, 6)));
        bridge.queue_frames(Ok(FrameSnapshot::new(150, 30, 6)));
        metrics.on_span_end(&mut span).await;
        tokio::task::yield_now().await;

        let mut event = event_for(&span, clock.now());
        metrics.process_event(&mut event).await;
        assert!(!event.measurements.is_empty());

        // A duplicate finalization of the same trace finds nothing: the
        // pop consumed the start snapshot.
        let mut second = event_for(&span, clock.now());
        metrics.process_event(&mut second).await;
        assert!(second.measurements.is_empty());
    }
}
