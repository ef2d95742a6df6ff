//! Next-frame timestamp race.
//!
//! Determining when the UI actually rendered is unreliable through any
//! single channel: the push-based native event is silently dropped on
//! some platform configurations, the pull call only knows the *last*
//! display time, and a purely local sample is not guaranteed to
//! correspond to a real paint. Each request therefore arms all three and
//! resolves from whichever the state machine accepts.
//!
//! The push event is ground truth: it wins whenever it arrives before
//! the hard deadline. Pull and fallback results are only stashed; they
//! are consulted at the deadline, pull preferred, and tagged as
//! fallbacks. The race itself is a pure transition function over
//! [`RaceState`], so the first-resolver-wins rule is testable without
//! real timers; the async driver merely feeds it events.

use crate::bridge::NativeBridge;
use crate::time::{Clock, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

/// Which source produced a resolved display timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampOrigin {
    /// Push-based native frame event.
    NativeEvent,
    /// Pull-based native call for the last known display time.
    NativePoll,
    /// Locally sampled clock on a cooperative scheduling opportunity.
    LocalFallback,
}

/// A resolved "UI rendered at" timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayTimestamp {
    pub timestamp: Timestamp,
    pub origin: TimestampOrigin,

    /// True when the native event never arrived and the value came from
    /// the deadline stash.
    pub is_fallback: bool,
}

/// Race lifecycle. One request moves `Idle → Racing → Resolved` (or
/// `Abandoned` when the deadline passes with an empty stash).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RaceState {
    Idle,
    Racing {
        /// Stashed pull-call result.
        polled: Option<Timestamp>,
        /// Stashed local clock sample.
        fallback: Option<Timestamp>,
    },
    Resolved(DisplayTimestamp),
    Abandoned,
}

/// Inputs to the race transition function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RaceEvent {
    /// A new request arms the sources.
    Armed,
    /// The native push event fired.
    NativeFrame(Timestamp),
    /// The pull call completed (possibly without a value).
    PollCompleted(Option<Timestamp>),
    /// The local fallback sampled the clock.
    FallbackSampled(Timestamp),
    /// The hard deadline passed.
    DeadlineElapsed,
}

/// The single transition function of the race.
///
/// Arming always starts from an empty stash so values from a previous
/// cycle cannot leak into this one; events arriving after resolution are
/// ignored.
pub fn transition(state: RaceState, event: RaceEvent) -> RaceState {
    match (state, event) {
        (_, RaceEvent::Armed) => RaceState::Racing {
            polled: None,
            fallback: None,
        },
        (RaceState::Racing { .. }, RaceEvent::NativeFrame(timestamp)) => {
            RaceState::Resolved(DisplayTimestamp {
                timestamp,
                origin: TimestampOrigin::NativeEvent,
                is_fallback: false,
            })
        }
        (RaceState::Racing { fallback, .. }, RaceEvent::PollCompleted(polled)) => {
            RaceState::Racing { polled, fallback }
        }
        (RaceState::Racing { polled, .. }, RaceEvent::FallbackSampled(timestamp)) => {
            RaceState::Racing {
                polled,
                fallback: Some(timestamp),
            }
        }
        (
            RaceState::Racing {
                polled: Some(timestamp),
                ..
            },
            RaceEvent::DeadlineElapsed,
        ) => RaceState::Resolved(DisplayTimestamp {
            timestamp,
            origin: TimestampOrigin::NativePoll,
            is_fallback: true,
        }),
        (
            RaceState::Racing {
                polled: None,
                fallback: Some(timestamp),
            },
            RaceEvent::DeadlineElapsed,
        ) => RaceState::Resolved(DisplayTimestamp {
            timestamp,
            origin: TimestampOrigin::LocalFallback,
            is_fallback: true,
        }),
        (
            RaceState::Racing {
                polled: None,
                fallback: None,
            },
            RaceEvent::DeadlineElapsed,
        ) => RaceState::Abandoned,
        (terminal, _) => terminal,
    }
}

/// Async driver racing the three sources against the hard deadline.
pub struct NextFrameRace {
    bridge: Arc<dyn NativeBridge>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl NextFrameRace {
    pub fn new(bridge: Arc<dyn NativeBridge>, clock: Arc<dyn Clock>, deadline: Duration) -> Self {
        NextFrameRace {
            bridge,
            clock,
            deadline,
        }
    }

    /// Resolve the timestamp of the next rendered frame.
    ///
    /// Returns `None` when no source produced anything before the
    /// deadline; the request is abandoned, not retried.
    pub async fn next_frame(&self) -> Option<DisplayTimestamp> {
        let mut state = transition(RaceState::Idle, RaceEvent::Armed);

        let mut events = self.bridge.new_frame_events();
        let mut poll_call = self.bridge.poll_next_frame_timestamp();
        let clock = self.clock.clone();
        let fallback = async move {
            // The next cooperative scheduling opportunity approximates
            // "the UI thread got a chance to paint".
            tokio::task::yield_now().await;
            clock.now()
        };
        tokio::pin!(fallback);
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        let mut push_closed = false;
        let mut poll_done = false;
        let mut fallback_done = false;

        while matches!(state, RaceState::Racing { .. }) {
            let event = tokio::select! {
                biased;
                received = events.recv(), if !push_closed => match received {
                    Ok(timestamp) => RaceEvent::NativeFrame(timestamp),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        debug!("native frame event channel closed");
                        push_closed = true;
                        continue;
                    }
                },
                result = &mut poll_call, if !poll_done => {
                    poll_done = true;
                    match result {
                        Ok(timestamp) => RaceEvent::PollCompleted(timestamp),
                        Err(bridge_error) => {
                            error!(error = %bridge_error, "failed to receive the native display timestamp");
                            RaceEvent::PollCompleted(None)
                        }
                    }
                },
                timestamp = &mut fallback, if !fallback_done => {
                    fallback_done = true;
                    RaceEvent::FallbackSampled(timestamp)
                },
                _ = &mut deadline => RaceEvent::DeadlineElapsed,
            };
            state = transition(state, event);
        }

        match state {
            RaceState::Resolved(display_ts) => {
                if display_ts.is_fallback {
                    warn!(
                        origin = ?display_ts.origin,
                        "native event emitter did not reply in time, using fallback display timestamp"
                    );
                }
                Some(display_ts)
            }
            RaceState::Abandoned => {
                error!("failed to receive any display timestamp before the deadline");
                None
            }
            RaceState::Idle | RaceState::Racing { .. } => None,
        }
    }
}
