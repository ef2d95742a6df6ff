//! Time-to-display span handling.
//!
//! Host instrumentation reports "the screen I care about rendered" by
//! asking the next-frame race for a timestamp; this module records the
//! resolved values per transaction cycle and splices them into the
//! finalized event: `ui.load.initial_display` / `ui.load.full_display`
//! child spans, the matching millisecond measurements, and a forward-only
//! extension of the event end.
//!
//! Recording is first-resolution-wins per (span, kind) cycle: repeated UI
//! updates racing each other on the same screen keep the earliest
//! resolved timestamp, and a full display can never end before its
//! initial display.

use crate::bridge::NativeBridge;
use crate::config::TimingConfig;
use crate::event::{measurement, op, origin, Measurement, SpanRecord, SpanStatus, TransactionEvent};
use crate::expiring::{ExpiringMap, ExpiringMapConfig};
use crate::ids::SpanId;
use crate::next_frame::{DisplayTimestamp, NextFrameRace};
use crate::time::{Clock, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for display tracking.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// Full-display durations beyond this reuse the initial-display
    /// measurement instead of their own.
    pub full_display_deadline: Duration,

    /// How long a resolved display timestamp waits to be consumed by
    /// event finalization.
    pub display_ttl: Duration,

    /// Sweep interval for the resolved-timestamp map.
    pub cleanup_interval: Duration,

    /// Hard timeout for the next-frame race.
    pub next_frame_deadline: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for DisplayConfig {
    fn from(config: &TimingConfig) -> Self {
        DisplayConfig {
            full_display_deadline: config.full_display_deadline,
            display_ttl: config.display_ttl,
            cleanup_interval: config.cleanup_interval,
            next_frame_deadline: config.next_frame_deadline,
        }
    }
}

/// Which display milestone a recorded timestamp belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayKind {
    Initial,
    Full,
}

/// Records next-frame resolutions and splices them into finalized events.
pub struct DisplayTracker {
    race: NextFrameRace,
    config: DisplayConfig,

    /// Resolved timestamps waiting for event finalization, keyed by
    /// (root span, milestone). TTL-bounded: a transaction that is never
    /// finalized must not pin its timestamps forever.
    resolved: ExpiringMap<(SpanId, DisplayKind), DisplayTimestamp>,
}

impl DisplayTracker {
    pub fn new(
        bridge: Arc<dyn NativeBridge>,
        clock: Arc<dyn Clock>,
        config: DisplayConfig,
    ) -> Self {
        let race = NextFrameRace::new(bridge, clock, config.next_frame_deadline);
        let resolved = ExpiringMap::new(ExpiringMapConfig {
            ttl: config.display_ttl,
            cleanup_interval: config.cleanup_interval,
        });
        DisplayTracker {
            race,
            config,
            resolved,
        }
    }

    /// The screen reached initial display: race for the next frame and
    /// record its timestamp for `root_span`'s transaction.
    pub async fn record_initial_display(&self, root_span: SpanId) {
        self.record(root_span, DisplayKind::Initial).await;
    }

    /// The screen reached full display.
    pub async fn record_full_display(&self, root_span: SpanId) {
        self.record(root_span, DisplayKind::Full).await;
    }

    async fn record(&self, root_span: SpanId, kind: DisplayKind) {
        let key = (root_span, kind);
        if self.resolved.contains_key(&key) {
            debug!(span = %root_span, ?kind, "display already recorded for this cycle, ignoring");
            return;
        }

        // Failure is already logged by the race; an unresolved request
        // simply leaves no timestamp to consume.
        let Some(display_ts) = self.race.next_frame().await else {
            return;
        };

        // A concurrent UI update may have resolved while we were racing;
        // the first resolution wins the cycle.
        if self.resolved.contains_key(&key) {
            debug!(span = %root_span, ?kind, "display resolved concurrently, ignoring late value");
            return;
        }
        self.resolved.insert(key, display_ts);
        debug!(
            span = %root_span,
            ?kind,
            timestamp = display_ts.timestamp.as_secs(),
            origin = ?display_ts.origin,
            "recorded display timestamp"
        );
    }

    /// Event pipeline hook: attach display spans and measurements.
    pub async fn process_event(&self, event: &mut TransactionEvent) {
        let root_span = event.trace.span_id;

        let initial = match self.resolved.pop(&(root_span, DisplayKind::Initial)) {
            Some(lookup) => lookup.resolved().await,
            None => None,
        };
        let full = match self.resolved.pop(&(root_span, DisplayKind::Full)) {
            Some(lookup) => lookup.resolved().await,
            None => None,
        };

        if let Some(display) = initial {
            self.apply_initial_display(event, root_span, display.timestamp);
        }

        let initial_span_end = event
            .span_by_op(op::INITIAL_DISPLAY)
            .and_then(|span| span.timestamp);

        if let Some(display) = full {
            match initial_span_end {
                Some(initial_end) => {
                    self.apply_full_display(event, root_span, display.timestamp, initial_end);
                }
                None => {
                    warn!(
                        span = %root_span,
                        "full display resolved without an initial display span, dropping"
                    );
                }
            }
        }

        self.set_display_measurements(event);

        // The transaction must cover every display span it carries; ends
        // only ever move forward.
        let mut latest = event.timestamp;
        for display_op in [op::INITIAL_DISPLAY, op::FULL_DISPLAY] {
            if let Some(end) = event.span_by_op(display_op).and_then(|span| span.timestamp) {
                latest = latest.max(end);
            }
        }
        event.timestamp = latest;
    }

    fn apply_initial_display(
        &self,
        event: &mut TransactionEvent,
        root_span: SpanId,
        end: Timestamp,
    ) {
        match event.span_by_op_mut(op::INITIAL_DISPLAY) {
            Some(span) if span.status != SpanStatus::Ok => {
                span.status = SpanStatus::Ok;
                span.timestamp = Some(end);
                debug!(span = %root_span, "updated existing initial display span");
            }
            Some(_) => {
                debug!(span = %root_span, "initial display span already ended, ignoring late value");
            }
            None => {
                let mut span = SpanRecord::new(
                    event.trace.trace_id,
                    SpanId::random(),
                    Some(root_span),
                    op::INITIAL_DISPLAY,
                    "Time To Initial Display",
                    event.start_timestamp,
                );
                span.timestamp = Some(end);
                span.status = SpanStatus::Ok;
                span.origin = Some(origin::MANUAL_TIME_TO_DISPLAY.to_string());
                event.spans.push(span);
                debug!(span = %root_span, "added initial display span");
            }
        }
    }

    fn apply_full_display(
        &self,
        event: &mut TransactionEvent,
        root_span: SpanId,
        end: Timestamp,
        initial_end: Timestamp,
    ) {
        let end = if end < initial_end {
            // Full display cannot logically precede initial display.
            debug!(span = %root_span, "full display ended before initial display, extending to match");
            initial_end
        } else {
            end
        };

        match event.span_by_op_mut(op::FULL_DISPLAY) {
            Some(span) if span.status != SpanStatus::Ok => {
                span.status = SpanStatus::Ok;
                span.timestamp = Some(end);
                debug!(span = %root_span, "updated existing full display span");
            }
            Some(_) => {
                debug!(span = %root_span, "full display span already ended, ignoring late value");
            }
            None => {
                let duration_ms = end.millis_since(event.start_timestamp);
                let status = if duration_ms > self.config.full_display_deadline.as_millis() as f64 {
                    SpanStatus::DeadlineExceeded
                } else {
                    SpanStatus::Ok
                };
                let mut span = SpanRecord::new(
                    event.trace.trace_id,
                    SpanId::random(),
                    Some(root_span),
                    op::FULL_DISPLAY,
                    "Time To Full Display",
                    event.start_timestamp,
                );
                span.timestamp = Some(end);
                span.status = status;
                span.origin = Some(origin::MANUAL_TIME_TO_DISPLAY.to_string());
                event.spans.push(span);
                debug!(span = %root_span, "added full display span");
            }
        }
    }

    fn set_display_measurements(&self, event: &mut TransactionEvent) {
        let initial = event
            .span_by_op(op::INITIAL_DISPLAY)
            .and_then(|span| span.duration_millis());
        if let Some(duration_ms) = initial {
            event.set_measurement(
                measurement::TIME_TO_INITIAL_DISPLAY,
                Measurement::millis(duration_ms),
            );
        }

        let full = event
            .span_by_op(op::FULL_DISPLAY)
            .and_then(|span| span.duration_millis());
        if let Some(duration_ms) = full {
            if duration_ms > self.config.full_display_deadline.as_millis() as f64 {
                // Past the deadline the full-display duration is noise;
                // report initial display instead of an inflated value.
                let fallback = event
                    .measurements
                    .get(measurement::TIME_TO_INITIAL_DISPLAY)
                    .copied();
                if let Some(fallback) = fallback {
                    event.set_measurement(measurement::TIME_TO_FULL_DISPLAY, fallback);
                }
            } else {
                event.set_measurement(
                    measurement::TIME_TO_FULL_DISPLAY,
                    Measurement::millis(duration_ms),
                );
            }
        }
    }
}
