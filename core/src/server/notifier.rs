//! Notification fan-out to subscribed devices
//!
//! Delivery walks a snapshot of the subscriber set taken at call time;
//! devices subscribing mid-delivery catch the next round. One device
//! failing never blocks the rest.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::platform::BlePlatform;
use crate::server::connections::ConnectionTracker;
use crate::server::registry::ServiceRegistry;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Characteristic {0} is not a registered notify characteristic")]
    UnknownCharacteristic(Uuid),
}

// ============================================================================
// NOTIFIER
// ============================================================================

#[derive(Clone)]
pub struct Notifier {
    platform: Arc<dyn BlePlatform>,
    registry: Arc<ServiceRegistry>,
    tracker: Arc<ConnectionTracker>,
}

impl Notifier {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            platform,
            registry,
            tracker,
        }
    }

    /// Push `value` to every device currently subscribed to
    /// `characteristic`. Returns how many deliveries succeeded; transport
    /// failures are logged per device and skipped.
    pub async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<usize, NotifyError> {
        if !self.registry.is_notify_characteristic(characteristic) {
            return Err(NotifyError::UnknownCharacteristic(characteristic));
        }

        let subscribers = self.tracker.subscribers(characteristic);
        if subscribers.is_empty() {
            debug!(%characteristic, "no subscribers, nothing to notify");
            return Ok(0);
        }

        let mut delivered = 0;
        for device in &subscribers {
            match self
                .platform
                .notify_characteristic_changed(device, characteristic, value)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(%device, %characteristic, error = %e, "notification delivery failed");
                }
            }
        }
        debug!(
            %characteristic,
            delivered,
            subscribed = subscribers.len(),
            "notification fan-out complete"
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{
        ctf_service, ENABLE_NOTIFICATION_VALUE, CCCD_UUID, FLAG_CHARACTERISTIC_UUID,
        PASSWORD_CHARACTERISTIC_UUID,
    };
    use crate::platform::{DeviceId, GattServerEvent, LoopbackClient, LoopbackPlatform};
    use tokio::sync::mpsc;

    struct Fixture {
        platform: LoopbackPlatform,
        notifier: Notifier,
        tracker: Arc<ConnectionTracker>,
    }

    async fn fixture() -> Fixture {
        let platform = LoopbackPlatform::new();
        let (tx, mut rx) = mpsc::channel(16);
        platform.open_server(tx).await.expect("open server");

        let registry = Arc::new(ServiceRegistry::new(Arc::new(platform.clone())));
        let pump = registry.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let GattServerEvent::ServiceAdded { service, status } = event {
                    pump.complete_registration(service, status);
                }
            }
        });
        registry
            .register(ctf_service(b"pw".to_vec()))
            .await
            .expect("register service");

        let tracker = Arc::new(ConnectionTracker::new(registry.clone()));
        let notifier = Notifier::new(Arc::new(platform.clone()), registry, tracker.clone());
        Fixture {
            platform,
            notifier,
            tracker,
        }
    }

    fn subscribe(fixture: &Fixture, id: &str) -> LoopbackClient {
        let client = fixture.platform.client(id);
        fixture
            .tracker
            .on_subscription_write(
                &DeviceId::new(id),
                FLAG_CHARACTERISTIC_UUID,
                CCCD_UUID,
                &ENABLE_NOTIFICATION_VALUE,
            )
            .expect("subscribe device");
        client
    }

    #[tokio::test]
    async fn test_notify_reaches_all_subscribers() {
        let fixture = fixture().await;
        let mut alice = subscribe(&fixture, "AA:01");
        let mut bob = subscribe(&fixture, "AA:02");

        let delivered = fixture
            .notifier
            .notify(FLAG_CHARACTERISTIC_UUID, b"FLAG2 (1/3): it's")
            .await
            .expect("notify");

        assert_eq!(delivered, 2);
        for client in [&mut alice, &mut bob] {
            let (uuid, value) = client.recv_notification().await.expect("notification");
            assert_eq!(uuid, FLAG_CHARACTERISTIC_UUID);
            assert_eq!(value, b"FLAG2 (1/3): it's");
        }
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_a_no_op() {
        let fixture = fixture().await;

        let delivered = fixture
            .notifier
            .notify(FLAG_CHARACTERISTIC_UUID, b"nobody listening")
            .await
            .expect("notify");

        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_unknown_characteristic_rejected() {
        let fixture = fixture().await;

        let result = fixture
            .notifier
            .notify(PASSWORD_CHARACTERISTIC_UUID, b"x")
            .await;

        assert_eq!(
            result,
            Err(NotifyError::UnknownCharacteristic(
                PASSWORD_CHARACTERISTIC_UUID
            ))
        );
    }

    #[tokio::test]
    async fn test_one_failing_device_does_not_block_the_rest() {
        let fixture = fixture().await;
        let _failing = subscribe(&fixture, "AA:01");
        let mut healthy = subscribe(&fixture, "AA:02");
        fixture
            .platform
            .fail_notifications_to(&DeviceId::new("AA:01"), true);

        let delivered = fixture
            .notifier
            .notify(FLAG_CHARACTERISTIC_UUID, b"still going")
            .await
            .expect("notify");

        assert_eq!(delivered, 1);
        let (_, value) = healthy.recv_notification().await.expect("notification");
        assert_eq!(value, b"still going");
    }
}
