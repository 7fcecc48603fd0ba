//! GATT request dispatch
//!
//! Routes client read/write traffic coming off the platform event stream
//! and answers every request exactly once. Reads are served from the
//! registry with lenient offset slicing, CCCD writes go through the
//! connection tracker, prepared writes are buffered until the matching
//! execute arrives and then delivered like an immediate write.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::gatt::{GattStatus, ENABLE_NOTIFICATION_VALUE, NAME_CHARACTERISTIC_UUID};
use crate::platform::{BlePlatform, DeviceId, GattServerEvent};
use crate::server::connections::ConnectionTracker;
use crate::server::registry::ServiceRegistry;
use crate::server::writes::WriteReassembler;
use crate::ServerEvent;

/// Slice a stored value from a client-supplied offset; offsets past the
/// end read as empty rather than an error
fn tail_from(value: &[u8], offset: u16) -> &[u8] {
    value.get(offset as usize..).unwrap_or(&[])
}

// ============================================================================
// REQUEST DISPATCHER
// ============================================================================

pub struct RequestDispatcher {
    platform: Arc<dyn BlePlatform>,
    registry: Arc<ServiceRegistry>,
    tracker: Arc<ConnectionTracker>,
    writes: WriteReassembler,
    /// Characteristic targeted by each in-flight prepared write, recorded
    /// on the first fragment
    prepared_targets: Mutex<HashMap<u32, Uuid>>,
    names: Arc<RwLock<Vec<String>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl RequestDispatcher {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<ConnectionTracker>,
        names: Arc<RwLock<Vec<String>>>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            platform,
            registry,
            tracker,
            writes: WriteReassembler::new(),
            prepared_targets: Mutex::new(HashMap::new()),
            names,
            events,
        }
    }

    /// Handle one client request event; non-request events are ignored
    pub async fn dispatch(&self, event: GattServerEvent) {
        match event {
            GattServerEvent::CharacteristicReadRequest {
                device,
                request_id,
                offset,
                characteristic,
            } => {
                self.on_characteristic_read(device, request_id, offset, characteristic)
                    .await;
            }
            GattServerEvent::DescriptorReadRequest {
                device,
                request_id,
                characteristic,
                descriptor,
                ..
            } => {
                self.on_descriptor_read(device, request_id, characteristic, descriptor)
                    .await;
            }
            GattServerEvent::CharacteristicWriteRequest {
                device,
                request_id,
                characteristic,
                prepared,
                response_needed,
                offset,
                value,
            } => {
                self.on_characteristic_write(
                    device,
                    request_id,
                    characteristic,
                    prepared,
                    response_needed,
                    offset,
                    value,
                )
                .await;
            }
            GattServerEvent::DescriptorWriteRequest {
                device,
                request_id,
                characteristic,
                descriptor,
                response_needed,
                value,
                ..
            } => {
                self.on_descriptor_write(
                    device,
                    request_id,
                    characteristic,
                    descriptor,
                    response_needed,
                    value,
                )
                .await;
            }
            GattServerEvent::ExecuteWrite {
                device,
                request_id,
                execute,
            } => {
                self.on_execute_write(device, request_id, execute).await;
            }
            other => trace!(?other, "event is not a client request"),
        }
    }

    async fn on_characteristic_read(
        &self,
        device: DeviceId,
        request_id: u32,
        offset: u16,
        characteristic: Uuid,
    ) {
        match self.registry.read_value(characteristic) {
            Some(value) => {
                let slice = tail_from(&value, offset);
                debug!(%device, %characteristic, offset, len = slice.len(), "characteristic read");
                self.respond(&device, request_id, GattStatus::Success, offset, slice)
                    .await;
            }
            None => {
                debug!(%device, %characteristic, "read of unknown or unreadable characteristic");
                self.respond(&device, request_id, GattStatus::Failure, 0, &[])
                    .await;
            }
        }
    }

    async fn on_descriptor_read(
        &self,
        device: DeviceId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
    ) {
        if self.registry.has_descriptor(characteristic, descriptor) {
            self.respond(
                &device,
                request_id,
                GattStatus::Success,
                0,
                &ENABLE_NOTIFICATION_VALUE,
            )
            .await;
        } else {
            debug!(%device, %characteristic, %descriptor, "read of unknown descriptor");
            self.respond(&device, request_id, GattStatus::Failure, 0, &[])
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_characteristic_write(
        &self,
        device: DeviceId,
        request_id: u32,
        characteristic: Uuid,
        prepared: bool,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    ) {
        if !self.registry.is_writable(characteristic) {
            debug!(%device, %characteristic, "write to unknown or read-only characteristic");
            self.respond(&device, request_id, GattStatus::Failure, 0, &[])
                .await;
            return;
        }

        if prepared {
            self.writes.append(request_id, &value);
            self.prepared_targets
                .lock()
                .entry(request_id)
                .or_insert(characteristic);
            if response_needed {
                self.respond(&device, request_id, GattStatus::Success, offset, &[])
                    .await;
            }
        } else {
            self.deliver_write(&device, characteristic, &value);
            if response_needed {
                self.respond(&device, request_id, GattStatus::Success, 0, &[])
                    .await;
            }
        }
    }

    async fn on_descriptor_write(
        &self,
        device: DeviceId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
        response_needed: bool,
        value: Vec<u8>,
    ) {
        match self
            .tracker
            .on_subscription_write(&device, characteristic, descriptor, &value)
        {
            Ok(change) => {
                trace!(%device, %characteristic, ?change, "subscription updated");
                if response_needed {
                    self.respond(&device, request_id, GattStatus::Success, 0, &[])
                        .await;
                }
            }
            Err(e) => {
                debug!(%device, %characteristic, %descriptor, error = %e, "rejected descriptor write");
                self.respond(&device, request_id, GattStatus::Failure, 0, &[])
                    .await;
            }
        }
    }

    async fn on_execute_write(&self, device: DeviceId, request_id: u32, execute: bool) {
        if execute {
            let target = self.prepared_targets.lock().remove(&request_id);
            match self.writes.execute(request_id) {
                Some(assembled) => match target {
                    Some(characteristic) => {
                        debug!(
                            %device,
                            %characteristic,
                            len = assembled.len(),
                            "executing prepared write"
                        );
                        self.deliver_write(&device, characteristic, &assembled);
                    }
                    None => {
                        warn!(%device, request_id, "assembled fragments with no recorded target");
                    }
                },
                None => debug!(%device, request_id, "execute for unknown prepared write"),
            }
        } else {
            self.writes.cancel(request_id);
            self.prepared_targets.lock().remove(&request_id);
            debug!(%device, request_id, "prepared write cancelled");
        }
        // Execute and cancel both get a bare success
        self.respond(&device, request_id, GattStatus::Success, 0, &[])
            .await;
    }

    /// Apply a committed write to its characteristic. Name writes feed the
    /// received-names list; anything else is only logged.
    fn deliver_write(&self, device: &DeviceId, characteristic: Uuid, value: &[u8]) {
        if characteristic == NAME_CHARACTERISTIC_UUID {
            let name = String::from_utf8_lossy(value).into_owned();
            info!(%device, name = %name, "name received");
            self.names.write().push(name.clone());
            let _ = self.events.send(ServerEvent::NameReceived(name));
        } else {
            debug!(
                %device,
                %characteristic,
                value = %hex::encode(value),
                "characteristic write accepted"
            );
        }
    }

    async fn respond(
        &self,
        device: &DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) {
        if let Err(e) = self
            .platform
            .send_response(device, request_id, status, offset, value)
            .await
        {
            warn!(%device, request_id, error = %e, "failed to send response");
        }
    }
}
