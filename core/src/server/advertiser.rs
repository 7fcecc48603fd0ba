//! Advertisement lifecycle
//!
//! `start` submits the request to the platform and suspends until the
//! platform reports the outcome through the event stream; the pump resolves
//! the wait via [`Advertiser::complete_start`]. A successful start yields a
//! handle that `stop` checks so a stale caller cannot cancel a newer
//! advertising session.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::platform::{AdvertiseConfig, BlePlatform, PlatformError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum AdvertiseError {
    #[error("Advertising rejected by platform (code {code})")]
    Rejected { code: i32 },
    #[error("Another advertise start is still pending")]
    StartInProgress,
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("Platform closed before reporting the advertise outcome")]
    ChannelClosed,
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// Proof of a successful `start`; required to stop that same session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseHandle(u64);

#[derive(Default)]
struct AdvertiserState {
    handle: Option<AdvertiseHandle>,
    pending: Option<oneshot::Sender<Result<AdvertiseHandle, i32>>>,
    next_handle: u64,
}

// ============================================================================
// ADVERTISER
// ============================================================================

pub struct Advertiser {
    platform: Arc<dyn BlePlatform>,
    state: Mutex<AdvertiserState>,
}

impl Advertiser {
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self {
            platform,
            state: Mutex::new(AdvertiserState::default()),
        }
    }

    /// Start advertising and wait for the platform verdict. Calling while
    /// already advertising returns the existing handle without touching the
    /// platform.
    pub async fn start(&self, config: &AdvertiseConfig) -> Result<AdvertiseHandle, AdvertiseError> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(handle) = state.handle {
                debug!("already advertising, reusing active session");
                return Ok(handle);
            }
            if state.pending.is_some() {
                return Err(AdvertiseError::StartInProgress);
            }
            let (tx, rx) = oneshot::channel();
            state.pending = Some(tx);
            rx
        };

        if let Err(e) = self.platform.start_advertising(config).await {
            self.state.lock().pending = None;
            return Err(e.into());
        }

        match rx.await {
            Ok(Ok(handle)) => {
                info!(?config.mode, "advertising started");
                Ok(handle)
            }
            Ok(Err(code)) => {
                warn!(code, "advertising rejected");
                Err(AdvertiseError::Rejected { code })
            }
            Err(_) => Err(AdvertiseError::ChannelClosed),
        }
    }

    /// Resolve the pending `start`, called by the event pump when the
    /// platform reports the advertise outcome
    pub fn complete_start(&self, result: Result<(), i32>) {
        let mut state = self.state.lock();
        let Some(tx) = state.pending.take() else {
            warn!("advertise completion with no start pending");
            return;
        };
        let outcome = match result {
            Ok(()) => {
                state.next_handle += 1;
                let handle = AdvertiseHandle(state.next_handle);
                state.handle = Some(handle);
                Ok(handle)
            }
            Err(code) => Err(code),
        };
        let _ = tx.send(outcome);
    }

    /// Stop the session identified by `handle`. A stale or already-stopped
    /// handle is ignored.
    pub async fn stop(&self, handle: AdvertiseHandle) -> Result<(), AdvertiseError> {
        {
            let mut state = self.state.lock();
            match state.handle {
                Some(current) if current == handle => state.handle = None,
                Some(_) => {
                    debug!("stale advertise handle ignored");
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
        self.platform.stop_advertising().await?;
        info!("advertising stopped");
        Ok(())
    }

    /// Best-effort teardown used when the whole server shuts down
    pub async fn shutdown(&self) {
        let was_active = {
            let mut state = self.state.lock();
            state.pending = None;
            state.handle.take().is_some()
        };
        if was_active {
            let _ = self.platform.stop_advertising().await;
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.state.lock().handle.is_some()
    }
}
