//! GATT data model for the CTF peripheral service
//!
//! Wire-contract types shared by the registry, dispatcher, and platform
//! layer: fixed UUID constants, service/characteristic/descriptor
//! definitions, and the CCCD subscription sentinels. Existing clients
//! resolve the service by these exact identifiers, so the UUID values
//! must never change.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// UUID CONSTANTS (wire contract)
// ============================================================================

/// CTF service UUID
pub const CTF_SERVICE_UUID: Uuid = Uuid::from_u128(0xe2f5f000_b11f_4623_b6b1_7d5373925267);

/// Password characteristic: clients read the first flag here
pub const PASSWORD_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8c380001_10bd_4fdb_ba21_1922d6cf860d);

/// Name characteristic: clients write their name here (prepared writes allowed)
pub const NAME_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8c380002_10bd_4fdb_ba21_1922d6cf860d);

/// Flag characteristic: clients subscribe here for notification fragments
pub const FLAG_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8c380003_10bd_4fdb_ba21_1922d6cf860d);

/// Client Characteristic Configuration Descriptor (Bluetooth assigned number 0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that enables notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value that disables notifications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors for GATT service definitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Service has no characteristics")]
    NoCharacteristics,
    #[error("Duplicate characteristic UUID: {0}")]
    DuplicateCharacteristic(Uuid),
    #[error("Notify characteristic {0} has no CCCD descriptor")]
    MissingCccd(Uuid),
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// GATT response status sent back to a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    Failure,
}

impl GattStatus {
    /// Numeric status code on the wire (0x0000 success, 0x0101 generic failure)
    pub fn code(&self) -> i32 {
        match self {
            GattStatus::Success => 0x0000,
            GattStatus::Failure => 0x0101,
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "success"),
            GattStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Characteristic property bits exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacteristicProperty {
    Read,
    Write,
    Notify,
}

/// Attribute permission bits enforced by the platform stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributePermission {
    Read,
    Write,
}

/// Descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub uuid: Uuid,
    pub permissions: Vec<AttributePermission>,
}

impl DescriptorDefinition {
    pub fn new(uuid: Uuid, permissions: Vec<AttributePermission>) -> Self {
        Self { uuid, permissions }
    }

    /// Standard CCCD with read+write permissions
    pub fn cccd() -> Self {
        Self::new(
            CCCD_UUID,
            vec![AttributePermission::Read, AttributePermission::Write],
        )
    }
}

/// Characteristic declaration inside a service definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: Vec<CharacteristicProperty>,
    pub permissions: Vec<AttributePermission>,
    /// Payload returned to read requests, if the characteristic is readable
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<DescriptorDefinition>,
}

impl CharacteristicDefinition {
    pub fn new(
        uuid: Uuid,
        properties: Vec<CharacteristicProperty>,
        permissions: Vec<AttributePermission>,
    ) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            value: None,
            descriptors: Vec::new(),
        }
    }

    /// Set the read payload
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Attach a descriptor
    pub fn with_descriptor(mut self, descriptor: DescriptorDefinition) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(&CharacteristicProperty::Read)
    }

    pub fn is_writable(&self) -> bool {
        self.properties.contains(&CharacteristicProperty::Write)
    }

    pub fn is_notify(&self) -> bool {
        self.properties.contains(&CharacteristicProperty::Notify)
    }

    pub fn has_cccd(&self) -> bool {
        self.descriptors.iter().any(|d| d.uuid == CCCD_UUID)
    }
}

/// Complete service declaration handed to the platform at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic
    pub fn with_characteristic(mut self, characteristic: CharacteristicDefinition) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Look up a characteristic by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDefinition> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    /// Check the definition is registrable: non-empty, unique characteristic
    /// UUIDs, and every notify characteristic carries a CCCD for
    /// subscription management.
    pub fn validate(&self) -> Result<(), GattError> {
        if self.characteristics.is_empty() {
            return Err(GattError::NoCharacteristics);
        }
        for (i, characteristic) in self.characteristics.iter().enumerate() {
            if self.characteristics[..i]
                .iter()
                .any(|c| c.uuid == characteristic.uuid)
            {
                return Err(GattError::DuplicateCharacteristic(characteristic.uuid));
            }
            if characteristic.is_notify() && !characteristic.has_cccd() {
                return Err(GattError::MissingCccd(characteristic.uuid));
            }
        }
        Ok(())
    }
}

/// Build the canonical CTF service: a readable password characteristic
/// holding `password`, a writable name characteristic, and a notify-only
/// flag characteristic with the standard CCCD.
pub fn ctf_service(password: impl Into<Vec<u8>>) -> ServiceDefinition {
    ServiceDefinition::new(CTF_SERVICE_UUID)
        .with_characteristic(
            CharacteristicDefinition::new(
                PASSWORD_CHARACTERISTIC_UUID,
                vec![CharacteristicProperty::Read],
                vec![AttributePermission::Read],
            )
            .with_value(password),
        )
        .with_characteristic(CharacteristicDefinition::new(
            NAME_CHARACTERISTIC_UUID,
            vec![CharacteristicProperty::Write],
            vec![AttributePermission::Write],
        ))
        .with_characteristic(
            CharacteristicDefinition::new(
                FLAG_CHARACTERISTIC_UUID,
                vec![CharacteristicProperty::Notify],
                vec![AttributePermission::Read],
            )
            .with_descriptor(DescriptorDefinition::cccd()),
        )
}
