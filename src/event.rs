//! Event model the reconciliation core augments.
//!
//! The span/transaction lifecycle engine and the outbound transport are
//! external collaborators; this module only defines the in-memory shapes
//! they hand us. The core never owns serialization to the wire; it
//! splices spans and measurements into a [`TransactionEvent`] and returns
//! it to the pipeline.

use crate::ids::{SpanId, TraceId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Span operation names used by the core.
pub mod op {
    /// Transaction op once app-start data is attached.
    pub const UI_LOAD: &str = "ui.load";
    /// Cold app-start child span.
    pub const APP_START_COLD: &str = "app.start.cold";
    /// Warm app-start child span.
    pub const APP_START_WARM: &str = "app.start.warm";
    /// Time-to-initial-display child span.
    pub const INITIAL_DISPLAY: &str = "ui.load.initial_display";
    /// Time-to-full-display child span.
    pub const FULL_DISPLAY: &str = "ui.load.full_display";
}

/// Span origin markers.
pub mod origin {
    pub const AUTO_APP_START: &str = "auto.app.start";
    pub const MANUAL_APP_START: &str = "manual.app.start";
    pub const MANUAL_TIME_TO_DISPLAY: &str = "manual.ui.time_to_display";
}

/// Measurement names produced by the core.
pub mod measurement {
    pub const FRAMES_TOTAL: &str = "frames_total";
    pub const FRAMES_SLOW: &str = "frames_slow";
    pub const FRAMES_FROZEN: &str = "frames_frozen";
    pub const APP_START_COLD: &str = "app_start_cold";
    pub const APP_START_WARM: &str = "app_start_warm";
    pub const TIME_TO_INITIAL_DISPLAY: &str = "time_to_initial_display";
    pub const TIME_TO_FULL_DISPLAY: &str = "time_to_full_display";
}

/// Span data keys for per-span frame deltas.
pub mod span_data {
    pub const FRAMES_TOTAL: &str = "frames.total";
    pub const FRAMES_SLOW: &str = "frames.slow";
    pub const FRAMES_FROZEN: &str = "frames.frozen";
}

/// Span completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// Status not set: the span is still open or was never resolved.
    #[default]
    Unset,

    /// Span completed successfully.
    Ok,

    /// Span hit its deadline before completing.
    DeadlineExceeded,
}

/// A timed unit of work, parented within a trace.
///
/// This is both the live handle the lifecycle hooks receive and the JSON
/// shape spliced into a finalized [`TransactionEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Trace this span belongs to.
    pub trace_id: TraceId,

    /// Unique id of this span within the trace.
    pub span_id: SpanId,

    /// Parent span id; `None` marks the root span of the trace.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_span_id: Option<SpanId>,

    /// Operation name (e.g. `ui.load.initial_display`).
    pub op: String,

    /// Human-readable description.
    pub description: String,

    /// Origin marker (who created this span).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub origin: Option<String>,

    /// Physical start timestamp.
    pub start_timestamp: Timestamp,

    /// Physical end timestamp; `None` while the span is open.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<Timestamp>,

    /// Completion status.
    #[serde(default)]
    pub status: SpanStatus,

    /// Free-form span data (frame deltas land here).
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl SpanRecord {
    /// Create an open span.
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: Option<SpanId>,
        op: impl Into<String>,
        description: impl Into<String>,
        start_timestamp: Timestamp,
    ) -> Self {
        SpanRecord {
            trace_id,
            span_id,
            parent_span_id,
            op: op.into(),
            description: description.into(),
            origin: None,
            start_timestamp,
            timestamp: None,
            status: SpanStatus::Unset,
            data: HashMap::new(),
        }
    }

    /// Whether this is the root span of its trace.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Attach a data value.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Span duration in milliseconds, if ended.
    pub fn duration_millis(&self) -> Option<f64> {
        self.timestamp.map(|end| end.millis_since(self.start_timestamp))
    }
}

/// Unit attached to a [`Measurement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementUnit {
    /// Dimensionless counter (frame counts).
    None,
    /// Milliseconds (durations).
    Millisecond,
}

/// A named numeric measurement on a transaction event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: MeasurementUnit,
}

impl Measurement {
    /// Dimensionless count.
    pub fn count(value: f64) -> Self {
        Measurement {
            value,
            unit: MeasurementUnit::None,
        }
    }

    /// Millisecond duration.
    pub fn millis(value: f64) -> Self {
        Measurement {
            value,
            unit: MeasurementUnit::Millisecond,
        }
    }
}

/// Trace context of a finalized transaction event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: TraceId,

    /// Root span id of the transaction.
    pub span_id: SpanId,

    /// Transaction-level operation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub op: Option<String>,

    /// Origin marker.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub origin: Option<String>,

    /// Trace-level data.
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

/// A finalized transaction event flowing through the outbound pipeline.
///
/// The core only ever augments an event in place; it never fails one. A
/// processing error leaves the event exactly as it arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Transaction name.
    pub transaction: String,

    /// Trace context (carries the root span id used as correlation key).
    pub trace: TraceContext,

    /// Physical start of the root span.
    pub start_timestamp: Timestamp,

    /// Physical finish of the root span.
    pub timestamp: Timestamp,

    /// Finished child spans.
    #[serde(default)]
    pub spans: Vec<SpanRecord>,

    /// Named measurements.
    #[serde(default)]
    pub measurements: HashMap<String, Measurement>,
}

impl TransactionEvent {
    /// Create an event with no children or measurements.
    pub fn new(
        transaction: impl Into<String>,
        trace_id: TraceId,
        span_id: SpanId,
        start_timestamp: Timestamp,
        timestamp: Timestamp,
    ) -> Self {
        TransactionEvent {
            transaction: transaction.into(),
            trace: TraceContext {
                trace_id,
                span_id,
                op: None,
                origin: None,
                data: HashMap::new(),
            },
            start_timestamp,
            timestamp,
            spans: Vec::new(),
            measurements: HashMap::new(),
        }
    }

    /// Find a mutable child span by op.
    pub fn span_by_op_mut(&mut self, op: &str) -> Option<&mut SpanRecord> {
        self.spans.iter_mut().find(|s| s.op == op)
    }

    /// Find a child span by op.
    pub fn span_by_op(&self, op: &str) -> Option<&SpanRecord> {
        self.spans.iter().find(|s| s.op == op)
    }

    /// Set a named measurement.
    pub fn set_measurement(&mut self, name: impl Into<String>, m: Measurement) {
        self.measurements.insert(name.into(), m);
    }
}
