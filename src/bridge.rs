//! Native platform layer interface.
//!
//! Everything the core knows about the native side goes through
//! [`NativeBridge`]: an asynchronous, non-blocking boundary with no shared
//! clock and no completion-order guarantee. Implementations live in the
//! host SDK (one per platform); this crate ships only the trait, the data
//! shapes and a deadline-bounding helper.
//!
//! Bridge calls cannot be cancelled. A caller that loses interest simply
//! ignores the late result; the expiring maps reclaim whatever state was
//! parked for it.

use crate::time::Timestamp;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by native bridge calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The native side reported a failure.
    #[error("native call failed: {0}")]
    Native(String),

    /// The native side returned an empty response where data was required.
    #[error("native returned an empty response")]
    Empty,

    /// The native side did not reply within the deadline.
    #[error("native did not reply within {0:?}")]
    Deadline(Duration),
}

/// Cumulative frame counters since process start.
///
/// Counters are monotonically non-decreasing; two snapshots are only
/// comparable when fetched from the same device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub total_frames: u64,
    pub slow_frames: u64,
    pub frozen_frames: u64,
}

impl FrameSnapshot {
    pub fn new(total_frames: u64, slow_frames: u64, frozen_frames: u64) -> Self {
        FrameSnapshot {
            total_frames,
            slow_frames,
            frozen_frames,
        }
    }

    /// Per-field difference `self − start`.
    pub fn delta_since(&self, start: &FrameSnapshot) -> FrameDelta {
        FrameDelta {
            total: self.total_frames as i64 - start.total_frames as i64,
            slow: self.slow_frames as i64 - start.slow_frames as i64,
            frozen: self.frozen_frames as i64 - start.frozen_frames as i64,
        }
    }
}

/// Difference between two frame snapshots.
///
/// Signed: a restarted native counter or mismatched session produces
/// negative values, which callers drop as noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDelta {
    pub total: i64,
    pub slow: i64,
    pub frozen: i64,
}

impl FrameDelta {
    /// Flat or negative across the board. Native counters are sometimes
    /// flat across trivial spans and such deltas carry no signal.
    pub fn is_noise(&self) -> bool {
        self.total <= 0 && self.slow <= 0 && self.frozen <= 0
    }
}

/// Cold vs. warm process launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStartKind {
    Cold,
    Warm,
}

/// One-shot app-start record created by the native layer at process birth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppStartRecord {
    pub kind: AppStartKind,

    /// Native-side process start timestamp.
    pub start_timestamp: Timestamp,

    /// Set once the native layer has handed the record out; a record seen
    /// with this flag carries nothing new to attach.
    pub already_reported: bool,
}

/// Asynchronous interface to the native platform layer.
///
/// All methods return `'static` futures: the bridge serializes the request
/// and the reply arrives on the cooperative scheduler whenever the native
/// side gets to it.
pub trait NativeBridge: Send + Sync {
    /// Fetch the current cumulative frame counters.
    fn fetch_frames(&self) -> BoxFuture<'static, Result<FrameSnapshot, BridgeError>>;

    /// Fetch the process app-start record. `Ok(None)` when the native
    /// layer has no record (e.g. instrumentation disabled).
    fn fetch_app_start(&self) -> BoxFuture<'static, Result<Option<AppStartRecord>, BridgeError>>;

    /// Subscribe to the push-based "new frame rendered" event. Dropping
    /// the receiver unsubscribes.
    fn new_frame_events(&self) -> broadcast::Receiver<Timestamp>;

    /// Pull-based query for the last known display timestamp.
    fn poll_next_frame_timestamp(&self) -> BoxFuture<'static, Result<Option<Timestamp>, BridgeError>>;
}

/// Fetch frame counters with a hard deadline.
///
/// The underlying call keeps running on timeout (there is no real
/// cancellation); the caller just stops waiting for it.
pub async fn fetch_frames_bounded(
    bridge: &dyn NativeBridge,
    deadline: Duration,
) -> Result<FrameSnapshot, BridgeError> {
    match tokio::time::timeout(deadline, bridge.fetch_frames()).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Deadline(deadline)),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable bridge for unit tests.

    use super::{
        AppStartRecord, BridgeError, FrameSnapshot, NativeBridge,
    };
    use crate::time::Timestamp;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    pub struct MockBridge {
        frames: Mutex<VecDeque<Result<FrameSnapshot, BridgeError>>>,
        frames_delay: Mutex<Option<Duration>>,
        frames_calls: AtomicUsize,
        app_start: Mutex<Result<Option<AppStartRecord>, BridgeError>>,
        poll_response: Mutex<Result<Option<Timestamp>, BridgeError>>,
        poll_delay: Mutex<Option<Duration>>,
        new_frame_tx: broadcast::Sender<Timestamp>,
    }

    impl MockBridge {
        pub fn new() -> Self {
            let (new_frame_tx, _) = broadcast::channel(16);
            MockBridge {
                frames: Mutex::new(VecDeque::new()),
                frames_delay: Mutex::new(None),
                frames_calls: AtomicUsize::new(0),
                app_start: Mutex::new(Ok(None)),
                poll_response: Mutex::new(Ok(None)),
                poll_delay: Mutex::new(None),
                new_frame_tx,
            }
        }

        /// Queue the next `fetch_frames` response.
        pub fn queue_frames(&self, response: Result<FrameSnapshot, BridgeError>) {
            self.frames.lock().unwrap().push_back(response);
        }

        /// Delay every `fetch_frames` reply (for deadline tests).
        pub fn set_frames_delay(&self, delay: Duration) {
            *self.frames_delay.lock().unwrap() = Some(delay);
        }

        pub fn frames_calls(&self) -> usize {
            self.frames_calls.load(Ordering::SeqCst)
        }

        /// Install the process app-start record. The mock mirrors the
        /// native one-shot contract: the second fetch sees
        /// `already_reported = true`.
        pub fn set_app_start(&self, record: AppStartRecord) {
            *self.app_start.lock().unwrap() = Ok(Some(record));
        }

        pub fn set_app_start_error(&self, error: BridgeError) {
            *self.app_start.lock().unwrap() = Err(error);
        }

        pub fn set_poll_response(&self, response: Result<Option<Timestamp>, BridgeError>) {
            *self.poll_response.lock().unwrap() = response;
        }

        pub fn set_poll_delay(&self, delay: Duration) {
            *self.poll_delay.lock().unwrap() = Some(delay);
        }

        /// Fire the push-based new-frame event.
        pub fn emit_new_frame(&self, timestamp: Timestamp) {
            let _ = self.new_frame_tx.send(timestamp);
        }
    }

    impl NativeBridge for MockBridge {
        fn fetch_frames(&self) -> BoxFuture<'static, Result<FrameSnapshot, BridgeError>> {
            self.frames_calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .frames
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(BridgeError::Empty));
            let delay = *self.frames_delay.lock().unwrap();
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                response
            }
            .boxed()
        }

        fn fetch_app_start(
            &self,
        ) -> BoxFuture<'static, Result<Option<AppStartRecord>, BridgeError>> {
            let mut slot = self.app_start.lock().unwrap();
            let response = slot.clone();
            if let Ok(Some(record)) = slot.as_mut() {
                record.already_reported = true;
            }
            async move { response }.boxed()
        }

        fn new_frame_events(&self) -> broadcast::Receiver<Timestamp> {
            self.new_frame_tx.subscribe()
        }

        fn poll_next_frame_timestamp(
            &self,
        ) -> BoxFuture<'static, Result<Option<Timestamp>, BridgeError>> {
            let response = self.poll_response.lock().unwrap().clone();
            let delay = *self.poll_delay.lock().unwrap();
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                response
            }
            .boxed()
        }
    }
}
