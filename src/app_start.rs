//! App-start span and measurement attachment.
//!
//! The native layer records when the process actually started; the
//! application thread records when its root component was ready. This
//! component merges the two into the first finalized transaction of the
//! process: the event start is pulled back to cover pre-application
//! startup, a synthetic cold/warm start span is spliced in, and the
//! elapsed duration becomes a measurement.
//!
//! Both clocks are wall clocks on different sides of the bridge, so the
//! computed duration is occasionally wildly wrong (device clock skew,
//! processes resumed days later). Out-of-range durations are discarded in
//! production and kept in development mode for diagnosability.

use crate::bridge::{AppStartKind, NativeBridge};
use crate::config::TimingConfig;
use crate::event::{measurement, op, origin, Measurement, SpanRecord, SpanStatus, TransactionEvent};
use crate::ids::SpanId;
use crate::time::Timestamp;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for app-start attachment.
#[derive(Debug, Clone)]
pub struct AppStartConfig {
    /// App starts longer than this are discarded as clock skew.
    pub max_duration: Duration,

    /// Native start timestamps older than this relative to the
    /// transaction start are discarded as stale.
    pub max_age: Duration,

    /// Attach out-of-range app starts anyway.
    pub debug_mode: bool,
}

impl Default for AppStartConfig {
    fn default() -> Self {
        AppStartConfig::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for AppStartConfig {
    fn from(config: &TimingConfig) -> Self {
        AppStartConfig {
            max_duration: config.max_app_start_duration,
            max_age: config.max_app_start_age,
            debug_mode: config.debug_mode,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadyMark {
    timestamp: Timestamp,
    manual: bool,
}

#[derive(Debug, Default)]
struct AttacherState {
    /// Set once app-start data lands on a transaction; never reset for
    /// the lifetime of the process.
    flushed: bool,
    ready: Option<ReadyMark>,
    first_root_span: Option<SpanId>,
}

/// Splices app-start timing into the first transaction of the process.
pub struct AppStartAttacher {
    bridge: Arc<dyn NativeBridge>,
    config: AppStartConfig,
    state: Mutex<AttacherState>,
}

impl AppStartAttacher {
    pub fn new(bridge: Arc<dyn NativeBridge>, config: AppStartConfig) -> Self {
        AppStartAttacher {
            bridge,
            config,
            state: Mutex::new(AttacherState::default()),
        }
    }

    /// Record when the application thread considered itself ready,
    /// reported by host instrumentation.
    pub fn record_app_ready(&self, timestamp: Timestamp) {
        self.record_ready(timestamp, true);
    }

    /// Automatic variant used by the host's own wrapper instrumentation.
    pub fn record_app_ready_auto(&self, timestamp: Timestamp) {
        self.record_ready(timestamp, false);
    }

    fn record_ready(&self, timestamp: Timestamp, manual: bool) {
        let mut state = self.state.lock().unwrap();
        if state.ready.is_some() {
            warn!("overwriting an already recorded app ready timestamp");
        }
        state.ready = Some(ReadyMark { timestamp, manual });
    }

    /// Span lifecycle hook: remember the first root span of the process.
    /// App start only ever belongs to that span's transaction.
    pub fn on_span_start(&self, span: &SpanRecord) {
        if !span.is_root() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.first_root_span.is_none() {
            debug!(span = %span.span_id, "recorded first started root span");
            state.first_root_span = Some(span.span_id);
        }
    }

    /// Event pipeline hook: attach app-start data exactly once.
    pub async fn process_event(&self, event: &mut TransactionEvent) {
        let (first_root_span, ready) = {
            let state = self.state.lock().unwrap();
            if state.flushed {
                // Only the first transaction of the process gets app start.
                return;
            }
            (state.first_root_span, state.ready)
        };

        let Some(first_root_span) = first_root_span else {
            warn!("no started root span recorded, cannot attach app start");
            return;
        };
        if first_root_span != event.trace.span_id {
            warn!(
                expected = %first_root_span,
                actual = %event.trace.span_id,
                "transaction does not belong to the first root span, cannot attach app start"
            );
            return;
        }

        let record = match self.bridge.fetch_app_start().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("no app start record available from the native layer");
                return;
            }
            Err(error) => {
                warn!(%error, "failed to fetch the app start record");
                return;
            }
        };
        if record.already_reported {
            warn!("app start was already reported from the native layer");
            return;
        }

        let Some(ready) = ready else {
            warn!("app ready timestamp was never recorded, cannot compute app start duration");
            return;
        };

        let oldest_acceptable = event.start_timestamp.sub(self.config.max_age);
        if record.start_timestamp < oldest_acceptable && !self.config.debug_mode {
            warn!("app start timestamp is too far in the past, dropping");
            return;
        }

        let duration_ms = ready.timestamp.millis_since(record.start_timestamp);
        let out_of_range =
            duration_ms >= self.config.max_duration.as_millis() as f64 || duration_ms < 0.0;
        if out_of_range && !self.config.debug_mode {
            // Durations of hours or negative values show up in the wild;
            // reporting them would poison the aggregate.
            warn!(
                duration_ms,
                "app start duration is out of range, not adding the app start span"
            );
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.flushed = true;
        }

        let span_origin = if ready.manual {
            origin::MANUAL_APP_START
        } else {
            origin::AUTO_APP_START
        };

        event.trace.op = Some(op::UI_LOAD.to_string());
        event.trace.origin = Some(span_origin.to_string());
        event.start_timestamp = record.start_timestamp;

        for display_op in [op::INITIAL_DISPLAY, op::FULL_DISPLAY] {
            let measurement_name = if display_op == op::INITIAL_DISPLAY {
                measurement::TIME_TO_INITIAL_DISPLAY
            } else {
                measurement::TIME_TO_FULL_DISPLAY
            };
            let recomputed = event.span_by_op_mut(display_op).and_then(|span| {
                span.start_timestamp = record.start_timestamp;
                span.duration_millis()
            });
            if let Some(duration) = recomputed {
                event.set_measurement(measurement_name, Measurement::millis(duration));
            }
        }

        if event.timestamp < ready.timestamp {
            debug!("transaction ended before app start end, extending the event timestamp");
            event.timestamp = ready.timestamp;
        }

        let (start_op, description, measurement_name) = match record.kind {
            AppStartKind::Cold => (
                op::APP_START_COLD,
                "Cold App Start",
                measurement::APP_START_COLD,
            ),
            AppStartKind::Warm => (
                op::APP_START_WARM,
                "Warm App Start",
                measurement::APP_START_WARM,
            ),
        };

        let mut start_span = SpanRecord::new(
            event.trace.trace_id,
            SpanId::random(),
            Some(event.trace.span_id),
            start_op,
            description,
            record.start_timestamp,
        );
        start_span.timestamp = Some(ready.timestamp);
        start_span.status = SpanStatus::Ok;
        start_span.origin = Some(span_origin.to_string());
        event.spans.push(start_span);

        event.set_measurement(measurement_name, Measurement::millis(duration_ms));
        debug!(
            kind = ?record.kind,
            duration_ms,
            "attached app start span and measurement"
        );
    }
}
