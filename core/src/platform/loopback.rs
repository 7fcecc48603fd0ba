//! In-process loopback implementation of [`BlePlatform`]
//!
//! Simulates the peripheral platform and any number of central-side
//! devices entirely in memory: no radio, no permissions. Used by the
//! integration tests and the CLI demo. Each [`LoopbackClient`] injects
//! requests into the server's event channel and correlates the matching
//! `send_response` call through a oneshot keyed by request id; every
//! response is also recorded so tests can assert the
//! one-response-per-request rule.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::gatt::{
    GattStatus, ServiceDefinition, CCCD_UUID, DISABLE_NOTIFICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::platform::bridge::{
    AdvertiseConfig, BlePlatform, ConnectionState, DeviceId, GattServerEvent, PlatformError,
};

use async_trait::async_trait;

/// Request ids allocated for auto-numbered client operations start here so
/// tests can pick small explicit ids for prepared-write scenarios without
/// colliding.
const AUTO_REQUEST_ID_BASE: u32 = 1000;

/// One `send_response` call observed by the loopback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub device: DeviceId,
    pub request_id: u32,
    pub status: GattStatus,
    pub offset: u16,
    pub value: Vec<u8>,
}

struct ClientEndpoint {
    notifications: mpsc::UnboundedSender<(Uuid, Vec<u8>)>,
    fail_notifications: bool,
}

struct LoopbackInner {
    events: RwLock<Option<mpsc::Sender<GattServerEvent>>>,
    services: RwLock<HashMap<Uuid, ServiceDefinition>>,
    advertising: RwLock<Option<AdvertiseConfig>>,
    advertise_failure: Mutex<Option<i32>>,
    service_add_failure: AtomicBool,
    advertise_start_calls: AtomicU32,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<ResponseRecord>>>,
    responses: Mutex<Vec<ResponseRecord>>,
    clients: RwLock<HashMap<DeviceId, ClientEndpoint>>,
}

impl LoopbackInner {
    async fn emit(&self, event: GattServerEvent) -> Result<(), PlatformError> {
        let sender = match self.events.read().as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(PlatformError::ServerNotOpen),
        };
        sender
            .send(event)
            .await
            .map_err(|_| PlatformError::CallFailed("event channel closed".to_string()))
    }
}

/// In-memory BLE platform shared by the server and its loopback clients
#[derive(Clone)]
pub struct LoopbackPlatform {
    inner: Arc<LoopbackInner>,
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                events: RwLock::new(None),
                services: RwLock::new(HashMap::new()),
                advertising: RwLock::new(None),
                advertise_failure: Mutex::new(None),
                service_add_failure: AtomicBool::new(false),
                advertise_start_calls: AtomicU32::new(0),
                next_request_id: AtomicU32::new(AUTO_REQUEST_ID_BASE),
                pending: Mutex::new(HashMap::new()),
                responses: Mutex::new(Vec::new()),
                clients: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a central-side handle for a simulated remote device
    pub fn client(&self, id: impl Into<String>) -> LoopbackClient {
        let device = DeviceId::new(id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.clients.write().insert(
            device.clone(),
            ClientEndpoint {
                notifications: tx,
                fail_notifications: false,
            },
        );
        LoopbackClient {
            inner: Arc::clone(&self.inner),
            device,
            notifications: rx,
        }
    }

    /// Make the next advertising request fail with the given platform code
    pub fn fail_advertising(&self, code: i32) {
        *self.inner.advertise_failure.lock() = Some(code);
    }

    /// Make service registration complete with a failure status
    pub fn fail_service_add(&self, fail: bool) {
        self.inner.service_add_failure.store(fail, Ordering::SeqCst);
    }

    /// Make notifications to one device fail at the transport level
    pub fn fail_notifications_to(&self, device: &DeviceId, fail: bool) {
        if let Some(endpoint) = self.inner.clients.write().get_mut(device) {
            endpoint.fail_notifications = fail;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.events.read().is_some()
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.advertising.read().is_some()
    }

    pub fn advertising_config(&self) -> Option<AdvertiseConfig> {
        self.inner.advertising.read().clone()
    }

    pub fn has_service(&self, service: Uuid) -> bool {
        self.inner.services.read().contains_key(&service)
    }

    /// Number of `start_advertising` submissions seen, idempotency checks
    /// rely on this
    pub fn advertise_start_calls(&self) -> u32 {
        self.inner.advertise_start_calls.load(Ordering::SeqCst)
    }

    /// Every response sent so far, in order
    pub fn responses(&self) -> Vec<ResponseRecord> {
        self.inner.responses.lock().clone()
    }

    /// Responses sent for one request id
    pub fn responses_for(&self, request_id: u32) -> Vec<ResponseRecord> {
        self.inner
            .responses
            .lock()
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Poll for a response to `request_id`, for fire-and-forget requests
    /// where no oneshot waiter was registered. Gives the event pump up to
    /// half a second.
    pub async fn await_response(&self, request_id: u32) -> Option<ResponseRecord> {
        for _ in 0..100 {
            if let Some(record) = self.responses_for(request_id).into_iter().next() {
                return Some(record);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        None
    }
}

#[async_trait]
impl BlePlatform for LoopbackPlatform {
    async fn open_server(
        &self,
        events: mpsc::Sender<GattServerEvent>,
    ) -> Result<(), PlatformError> {
        debug!("loopback: GATT server opened");
        *self.inner.events.write() = Some(events);
        Ok(())
    }

    async fn close_server(&self) -> Result<(), PlatformError> {
        debug!("loopback: GATT server closed");
        *self.inner.events.write() = None;
        self.inner.services.write().clear();
        *self.inner.advertising.write() = None;
        self.inner.pending.lock().clear();
        Ok(())
    }

    async fn add_service(&self, service: &ServiceDefinition) -> Result<(), PlatformError> {
        let status = if self.inner.service_add_failure.load(Ordering::SeqCst) {
            GattStatus::Failure
        } else {
            self.inner
                .services
                .write()
                .insert(service.uuid, service.clone());
            GattStatus::Success
        };
        self.inner
            .emit(GattServerEvent::ServiceAdded {
                service: service.uuid,
                status,
            })
            .await
    }

    async fn remove_service(&self, service: Uuid) -> Result<(), PlatformError> {
        self.inner.services.write().remove(&service);
        Ok(())
    }

    async fn start_advertising(&self, config: &AdvertiseConfig) -> Result<(), PlatformError> {
        self.inner
            .advertise_start_calls
            .fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.advertise_failure.lock().take();
        match failure {
            Some(code) => self.inner.emit(GattServerEvent::AdvertiseFailed { code }).await,
            None => {
                *self.inner.advertising.write() = Some(config.clone());
                self.inner.emit(GattServerEvent::AdvertiseStarted).await
            }
        }
    }

    async fn stop_advertising(&self) -> Result<(), PlatformError> {
        *self.inner.advertising.write() = None;
        Ok(())
    }

    async fn send_response(
        &self,
        device: &DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        let record = ResponseRecord {
            device: device.clone(),
            request_id,
            status,
            offset,
            value: value.to_vec(),
        };
        trace!(%device, request_id, %status, "loopback: response");
        self.inner.responses.lock().push(record.clone());
        if let Some(waiter) = self.inner.pending.lock().remove(&request_id) {
            let _ = waiter.send(record);
        }
        Ok(())
    }

    async fn notify_characteristic_changed(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        let clients = self.inner.clients.read();
        let endpoint = clients
            .get(device)
            .ok_or_else(|| PlatformError::CallFailed(format!("no such device: {device}")))?;
        if endpoint.fail_notifications {
            return Err(PlatformError::CallFailed(format!(
                "simulated notify failure for {device}"
            )));
        }
        endpoint
            .notifications
            .send((characteristic, value.to_vec()))
            .map_err(|_| PlatformError::CallFailed("notification channel closed".to_string()))
    }
}

/// Central-side handle for one simulated remote device
pub struct LoopbackClient {
    inner: Arc<LoopbackInner>,
    device: DeviceId,
    notifications: mpsc::UnboundedReceiver<(Uuid, Vec<u8>)>,
}

impl LoopbackClient {
    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn next_request_id(&self) -> u32 {
        self.inner.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Inject the request event and wait for the matching response
    async fn request(
        &self,
        request_id: u32,
        event: GattServerEvent,
    ) -> Result<ResponseRecord, PlatformError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);
        if let Err(e) = self.inner.emit(event).await {
            self.inner.pending.lock().remove(&request_id);
            return Err(e);
        }
        rx.await
            .map_err(|_| PlatformError::CallFailed("response never arrived".to_string()))
    }

    pub async fn connect(&self) -> Result<(), PlatformError> {
        self.inner
            .emit(GattServerEvent::ConnectionStateChanged {
                device: self.device.clone(),
                state: ConnectionState::Connected,
            })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), PlatformError> {
        self.inner
            .emit(GattServerEvent::ConnectionStateChanged {
                device: self.device.clone(),
                state: ConnectionState::Disconnected,
            })
            .await
    }

    pub async fn read(&self, characteristic: Uuid) -> Result<ResponseRecord, PlatformError> {
        self.read_at(characteristic, 0).await
    }

    pub async fn read_at(
        &self,
        characteristic: Uuid,
        offset: u16,
    ) -> Result<ResponseRecord, PlatformError> {
        let request_id = self.next_request_id();
        self.request(
            request_id,
            GattServerEvent::CharacteristicReadRequest {
                device: self.device.clone(),
                request_id,
                offset,
                characteristic,
            },
        )
        .await
    }

    pub async fn read_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<ResponseRecord, PlatformError> {
        let request_id = self.next_request_id();
        self.request(
            request_id,
            GattServerEvent::DescriptorReadRequest {
                device: self.device.clone(),
                request_id,
                offset: 0,
                characteristic,
                descriptor,
            },
        )
        .await
    }

    /// Immediate write expecting a response
    pub async fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<ResponseRecord, PlatformError> {
        let request_id = self.next_request_id();
        self.request(
            request_id,
            GattServerEvent::CharacteristicWriteRequest {
                device: self.device.clone(),
                request_id,
                characteristic,
                prepared: false,
                response_needed: true,
                offset: 0,
                value: value.to_vec(),
            },
        )
        .await
    }

    /// Immediate write without response; returns the request id used
    pub async fn write_no_response(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<u32, PlatformError> {
        let request_id = self.next_request_id();
        self.inner
            .emit(GattServerEvent::CharacteristicWriteRequest {
                device: self.device.clone(),
                request_id,
                characteristic,
                prepared: false,
                response_needed: false,
                offset: 0,
                value: value.to_vec(),
            })
            .await?;
        Ok(request_id)
    }

    /// Queue one prepared-write fragment under an explicit request id
    pub async fn prepare_write(
        &self,
        request_id: u32,
        characteristic: Uuid,
        offset: u16,
        value: &[u8],
    ) -> Result<ResponseRecord, PlatformError> {
        self.request(
            request_id,
            GattServerEvent::CharacteristicWriteRequest {
                device: self.device.clone(),
                request_id,
                characteristic,
                prepared: true,
                response_needed: true,
                offset,
                value: value.to_vec(),
            },
        )
        .await
    }

    /// Commit queued fragments for `request_id`
    pub async fn execute_write(&self, request_id: u32) -> Result<ResponseRecord, PlatformError> {
        self.request(
            request_id,
            GattServerEvent::ExecuteWrite {
                device: self.device.clone(),
                request_id,
                execute: true,
            },
        )
        .await
    }

    /// Discard queued fragments for `request_id`
    pub async fn cancel_write(&self, request_id: u32) -> Result<ResponseRecord, PlatformError> {
        self.request(
            request_id,
            GattServerEvent::ExecuteWrite {
                device: self.device.clone(),
                request_id,
                execute: false,
            },
        )
        .await
    }

    pub async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<ResponseRecord, PlatformError> {
        let request_id = self.next_request_id();
        self.request(
            request_id,
            GattServerEvent::DescriptorWriteRequest {
                device: self.device.clone(),
                request_id,
                characteristic,
                descriptor,
                response_needed: true,
                offset: 0,
                value: value.to_vec(),
            },
        )
        .await
    }

    /// Descriptor write without response; returns the request id used
    pub async fn write_descriptor_no_response(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<u32, PlatformError> {
        let request_id = self.next_request_id();
        self.inner
            .emit(GattServerEvent::DescriptorWriteRequest {
                device: self.device.clone(),
                request_id,
                characteristic,
                descriptor,
                response_needed: false,
                offset: 0,
                value: value.to_vec(),
            })
            .await?;
        Ok(request_id)
    }

    /// Enable notifications on `characteristic` via its CCCD
    pub async fn subscribe(&self, characteristic: Uuid) -> Result<ResponseRecord, PlatformError> {
        self.write_descriptor(characteristic, CCCD_UUID, &ENABLE_NOTIFICATION_VALUE)
            .await
    }

    /// Disable notifications on `characteristic` via its CCCD
    pub async fn unsubscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<ResponseRecord, PlatformError> {
        self.write_descriptor(characteristic, CCCD_UUID, &DISABLE_NOTIFICATION_VALUE)
            .await
    }

    /// Wait for the next notification pushed to this device
    pub async fn recv_notification(&mut self) -> Option<(Uuid, Vec<u8>)> {
        self.notifications.recv().await
    }

    /// Non-blocking notification check
    pub fn try_notification(&mut self) -> Option<(Uuid, Vec<u8>)> {
        self.notifications.try_recv().ok()
    }
}
