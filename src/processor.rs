//! Wiring of the timing components.
//!
//! [`TimingProcessor`] is the single instance the host SDK constructs at
//! initialization and hands to its span lifecycle and event pipeline. It
//! owns all process-wide state (the app-start guard, the snapshot maps,
//! the recorded display timestamps); there are no module-level globals
//! to reset between tests or reloads.

use crate::app_start::{AppStartAttacher, AppStartConfig};
use crate::bridge::NativeBridge;
use crate::config::TimingConfig;
use crate::display::{DisplayConfig, DisplayTracker};
use crate::event::{SpanRecord, TransactionEvent};
use crate::frames::{FrameMetrics, FramesConfig};
use crate::ids::SpanId;
use crate::time::{Clock, SystemClock, Timestamp};
use std::sync::Arc;

/// Entry point of the timing reconciliation core.
pub struct TimingProcessor {
    app_start: AppStartAttacher,
    frames: FrameMetrics,
    display: DisplayTracker,
}

impl TimingProcessor {
    /// Construct with the system wall clock.
    pub fn new(bridge: Arc<dyn NativeBridge>, config: TimingConfig) -> Self {
        Self::with_clock(bridge, config, Arc::new(SystemClock))
    }

    /// Construct with an injected clock (tests use a manual one).
    pub fn with_clock(
        bridge: Arc<dyn NativeBridge>,
        config: TimingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        TimingProcessor {
            app_start: AppStartAttacher::new(bridge.clone(), AppStartConfig::from(&config)),
            frames: FrameMetrics::new(bridge.clone(), clock.clone(), FramesConfig::from(&config)),
            display: DisplayTracker::new(bridge, clock, DisplayConfig::from(&config)),
        }
    }

    /// Span lifecycle hook: a span started.
    pub fn on_span_start(&self, span: &SpanRecord) {
        self.app_start.on_span_start(span);
        self.frames.on_span_start(span);
    }

    /// Span lifecycle hook: a span ended.
    pub async fn on_span_end(&self, span: &mut SpanRecord) {
        self.frames.on_span_end(span).await;
    }

    /// Host instrumentation reported the application ready.
    pub fn record_app_ready(&self, timestamp: Timestamp) {
        self.app_start.record_app_ready(timestamp);
    }

    /// Automatic variant of [`Self::record_app_ready`].
    pub fn record_app_ready_auto(&self, timestamp: Timestamp) {
        self.app_start.record_app_ready_auto(timestamp);
    }

    /// Host instrumentation reported initial display for a transaction.
    pub async fn record_initial_display(&self, root_span: SpanId) {
        self.display.record_initial_display(root_span).await;
    }

    /// Host instrumentation reported full display for a transaction.
    pub async fn record_full_display(&self, root_span: SpanId) {
        self.display.record_full_display(root_span).await;
    }

    /// Event pipeline hook: enrich a finalized transaction event.
    ///
    /// Components run in registration order: app start first (it may
    /// move the event start and snap display spans), then frames, then
    /// display. Every component absorbs its own failures; the event is
    /// returned enriched or untouched, never dropped.
    pub async fn process_event(&self, event: &mut TransactionEvent) {
        self.app_start.process_event(event).await;
        self.frames.process_event(event).await;
        self.display.process_event(event).await;
    }
}
