//! Per-device connection and subscription tracking
//!
//! The tracker is the sole mutator of the subscriber sets. It reacts to
//! connection state events and to CCCD writes; the notifier only reads
//! snapshots. Disconnects clear a device's subscriptions unconditionally,
//! whatever its subscribe/unsubscribe history.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::gatt::{DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
use crate::platform::{ConnectionState, DeviceId};
use crate::server::registry::ServiceRegistry;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Malformed client request; answered with a failure response, the
/// connection stays open
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Subscription write with invalid CCCD value")]
    InvalidValue,
    #[error("Subscription write to unknown characteristic/descriptor pair")]
    UnknownTarget,
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// A remote device the server currently knows about
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    pub id: DeviceId,
    /// Notify characteristics this device subscribed to
    pub subscriptions: HashSet<Uuid>,
}

impl ConnectedDevice {
    fn new(id: DeviceId) -> Self {
        Self {
            id,
            subscriptions: HashSet::new(),
        }
    }
}

/// Outcome of a valid subscription write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Enabled,
    Disabled,
}

// ============================================================================
// CONNECTION TRACKER
// ============================================================================

pub struct ConnectionTracker {
    registry: Arc<ServiceRegistry>,
    devices: RwLock<HashMap<DeviceId, ConnectedDevice>>,
}

impl ConnectionTracker {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Track connects; on disconnect, drop the device and all its
    /// subscriptions
    pub fn on_connection_state_changed(&self, device: &DeviceId, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.devices
                    .write()
                    .entry(device.clone())
                    .or_insert_with(|| ConnectedDevice::new(device.clone()));
                debug!(%device, "device connected");
            }
            ConnectionState::Disconnected => {
                if let Some(removed) = self.devices.write().remove(device) {
                    info!(
                        %device,
                        cleared_subscriptions = removed.subscriptions.len(),
                        "device disconnected"
                    );
                }
            }
        }
    }

    /// Apply a CCCD write. The target pair must be a registered notify
    /// characteristic with its CCCD, and the value must exactly match one
    /// of the two sentinels; anything else leaves the subscriber set
    /// untouched and surfaces a protocol error for the dispatcher to answer
    /// with failure.
    pub fn on_subscription_write(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<SubscriptionChange, ProtocolError> {
        if !self.registry.is_subscribable(characteristic, descriptor) {
            return Err(ProtocolError::UnknownTarget);
        }

        if value == ENABLE_NOTIFICATION_VALUE {
            // A device that writes is connected even if its connect event
            // was never observed.
            let mut devices = self.devices.write();
            let entry = devices
                .entry(device.clone())
                .or_insert_with(|| ConnectedDevice::new(device.clone()));
            entry.subscriptions.insert(characteristic);
            info!(%device, %characteristic, "notifications enabled");
            Ok(SubscriptionChange::Enabled)
        } else if value == DISABLE_NOTIFICATION_VALUE {
            if let Some(entry) = self.devices.write().get_mut(device) {
                entry.subscriptions.remove(&characteristic);
            }
            info!(%device, %characteristic, "notifications disabled");
            Ok(SubscriptionChange::Disabled)
        } else {
            Err(ProtocolError::InvalidValue)
        }
    }

    /// Snapshot of the devices subscribed to `characteristic` at call time
    pub fn subscribers(&self, characteristic: Uuid) -> Vec<DeviceId> {
        self.devices
            .read()
            .values()
            .filter(|d| d.subscriptions.contains(&characteristic))
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn is_subscribed(&self, device: &DeviceId, characteristic: Uuid) -> bool {
        self.devices
            .read()
            .get(device)
            .is_some_and(|d| d.subscriptions.contains(&characteristic))
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.devices.read().contains_key(device)
    }

    pub fn connected_count(&self) -> usize {
        self.devices.read().len()
    }
}
