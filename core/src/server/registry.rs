//! Service registration with asynchronous platform confirmation
//!
//! `register` validates the definition, submits it, then suspends until the
//! event pump reports the platform verdict through
//! [`ServiceRegistry::complete_registration`]. A service only becomes
//! visible to lookups once the platform confirmed it, so request handling
//! never consults a half-registered service.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gatt::{CharacteristicDefinition, GattError, GattStatus, ServiceDefinition, CCCD_UUID};
use crate::platform::{BlePlatform, PlatformError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum RegistrationError {
    #[error("Invalid service definition: {0}")]
    InvalidService(#[from] GattError),
    #[error("Service {0} is already registered")]
    AlreadyRegistered(Uuid),
    #[error("Registration of service {0} is still pending")]
    InProgress(Uuid),
    #[error("Platform rejected service {service}")]
    Rejected { service: Uuid },
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("Platform closed before confirming the registration")]
    ChannelClosed,
}

// ============================================================================
// SERVICE REGISTRY
// ============================================================================

struct PendingRegistration {
    definition: ServiceDefinition,
    tx: oneshot::Sender<Result<(), GattStatus>>,
}

pub struct ServiceRegistry {
    platform: Arc<dyn BlePlatform>,
    services: RwLock<HashMap<Uuid, ServiceDefinition>>,
    pending: Mutex<HashMap<Uuid, PendingRegistration>>,
}

impl ServiceRegistry {
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self {
            platform,
            services: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a service and wait until the platform confirms it
    pub async fn register(&self, service: ServiceDefinition) -> Result<(), RegistrationError> {
        service.validate()?;
        let uuid = service.uuid;

        let rx = {
            let mut pending = self.pending.lock();
            if self.services.read().contains_key(&uuid) {
                return Err(RegistrationError::AlreadyRegistered(uuid));
            }
            if pending.contains_key(&uuid) {
                return Err(RegistrationError::InProgress(uuid));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(
                uuid,
                PendingRegistration {
                    definition: service.clone(),
                    tx,
                },
            );
            rx
        };

        if let Err(e) = self.platform.add_service(&service).await {
            self.pending.lock().remove(&uuid);
            return Err(e.into());
        }

        match rx.await {
            Ok(Ok(())) => {
                info!(service = %uuid, "service registered");
                Ok(())
            }
            Ok(Err(status)) => {
                warn!(service = %uuid, %status, "service registration rejected");
                Err(RegistrationError::Rejected { service: uuid })
            }
            Err(_) => Err(RegistrationError::ChannelClosed),
        }
    }

    /// Resolve a pending registration, called by the event pump when the
    /// platform reports the service-added outcome
    pub fn complete_registration(&self, service: Uuid, status: GattStatus) {
        let Some(pending) = self.pending.lock().remove(&service) else {
            warn!(%service, "service-added event with no registration pending");
            return;
        };
        let outcome = match status {
            GattStatus::Success => {
                self.services.write().insert(service, pending.definition);
                Ok(())
            }
            GattStatus::Failure => Err(status),
        };
        let _ = pending.tx.send(outcome);
    }

    /// Remove a registered service; unknown services are a no-op
    pub async fn deregister(&self, service: Uuid) -> Result<(), RegistrationError> {
        if self.services.write().remove(&service).is_none() {
            debug!(%service, "deregister of unknown service ignored");
            return Ok(());
        }
        self.platform.remove_service(service).await?;
        info!(%service, "service deregistered");
        Ok(())
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn is_registered(&self, service: Uuid) -> bool {
        self.services.read().contains_key(&service)
    }

    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    /// Find a characteristic across all registered services
    pub fn find_characteristic(&self, characteristic: Uuid) -> Option<CharacteristicDefinition> {
        self.services
            .read()
            .values()
            .find_map(|s| s.characteristic(characteristic).cloned())
    }

    /// Stored value of a readable characteristic, empty if it has none
    pub fn read_value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        let found = self.find_characteristic(characteristic)?;
        if !found.is_readable() {
            return None;
        }
        Some(found.value.unwrap_or_default())
    }

    pub fn is_writable(&self, characteristic: Uuid) -> bool {
        self.find_characteristic(characteristic)
            .is_some_and(|c| c.is_writable())
    }

    pub fn is_notify_characteristic(&self, characteristic: Uuid) -> bool {
        self.find_characteristic(characteristic)
            .is_some_and(|c| c.is_notify())
    }

    /// Whether `(characteristic, descriptor)` is a valid subscription
    /// target, the descriptor must be the CCCD of a notify characteristic
    pub fn is_subscribable(&self, characteristic: Uuid, descriptor: Uuid) -> bool {
        descriptor == CCCD_UUID
            && self
                .find_characteristic(characteristic)
                .is_some_and(|c| c.is_notify() && c.has_cccd())
    }

    /// Whether `characteristic` carries a descriptor with this UUID
    pub fn has_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> bool {
        self.find_characteristic(characteristic)
            .is_some_and(|c| c.descriptors.iter().any(|d| d.uuid == descriptor))
    }
}
