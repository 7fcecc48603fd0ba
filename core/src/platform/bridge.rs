//! Platform bridge for the BLE peripheral stack
//!
//! The core never drives a radio directly. Platform-specific code
//! implements [`BlePlatform`] and delivers inbound GATT activity as
//! [`GattServerEvent`]s over the channel handed to `open_server`.
//! Submission calls fail synchronously; completion of advertising and
//! service registration arrives asynchronously as events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gatt::{GattStatus, ServiceDefinition, CTF_SERVICE_UUID};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("Bluetooth unavailable on this device")]
    Unavailable,
    #[error("GATT server not open")]
    ServerNotOpen,
    #[error("Platform call failed: {0}")]
    CallFailed(String),
}

// ============================================================================
// DEVICE IDENTITY
// ============================================================================

/// Opaque identity of a remote device (address or platform handle)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Link state reported for a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

// ============================================================================
// ADVERTISING CONFIGURATION
// ============================================================================

/// Power/latency tradeoff for the advertisement interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// Transmit power level for advertisement packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

/// Advertisement parameters handed to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    pub mode: AdvertiseMode,
    pub connectable: bool,
    /// Zero means advertise until stopped
    pub timeout: Duration,
    pub tx_power: TxPowerLevel,
    pub include_device_name: bool,
    pub include_service_uuid: bool,
    /// UUID placed in the advertisement when `include_service_uuid` is set
    pub service_uuid: Uuid,
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::Balanced,
            connectable: true,
            timeout: Duration::ZERO,
            tx_power: TxPowerLevel::Medium,
            include_device_name: true,
            include_service_uuid: false,
            service_uuid: CTF_SERVICE_UUID,
        }
    }
}

impl AdvertiseConfig {
    pub fn with_mode(mut self, mode: AdvertiseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.include_service_uuid = true;
        self.service_uuid = uuid;
        self
    }
}

// ============================================================================
// PLATFORM EVENTS
// ============================================================================

/// Inbound activity from the platform GATT server, one variant per callback
/// kind. Request events carry the platform-assigned request id that the
/// response must echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattServerEvent {
    /// Advertising started successfully
    AdvertiseStarted,
    /// Platform refused to advertise
    AdvertiseFailed { code: i32 },
    /// Service registration completed
    ServiceAdded { service: Uuid, status: GattStatus },
    /// A remote device connected or disconnected
    ConnectionStateChanged {
        device: DeviceId,
        state: ConnectionState,
    },
    /// Read of a characteristic value
    CharacteristicReadRequest {
        device: DeviceId,
        request_id: u32,
        offset: u16,
        characteristic: Uuid,
    },
    /// Read of a descriptor value
    DescriptorReadRequest {
        device: DeviceId,
        request_id: u32,
        offset: u16,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    /// Write to a characteristic; `prepared` marks a queued-write fragment
    CharacteristicWriteRequest {
        device: DeviceId,
        request_id: u32,
        characteristic: Uuid,
        prepared: bool,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    },
    /// Write to a descriptor (notification subscription control)
    DescriptorWriteRequest {
        device: DeviceId,
        request_id: u32,
        characteristic: Uuid,
        descriptor: Uuid,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    },
    /// Commit (`execute` true) or discard (`execute` false) queued writes
    ExecuteWrite {
        device: DeviceId,
        request_id: u32,
        execute: bool,
    },
}

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Platform-specific BLE peripheral API abstraction
///
/// Implementers provide the actual advertising and GATT server calls for
/// their platform. The event sender passed to `open_server` is where all
/// inbound callbacks are delivered; the platform must deliver request
/// events in arrival order.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Open the GATT server and register the event channel
    async fn open_server(&self, events: mpsc::Sender<GattServerEvent>)
        -> Result<(), PlatformError>;

    /// Close the GATT server and release its resources
    async fn close_server(&self) -> Result<(), PlatformError>;

    /// Submit a service for registration; completion arrives as
    /// [`GattServerEvent::ServiceAdded`]
    async fn add_service(&self, service: &ServiceDefinition) -> Result<(), PlatformError>;

    /// Remove a registered service
    async fn remove_service(&self, service: Uuid) -> Result<(), PlatformError>;

    /// Submit an advertising request; completion arrives as
    /// [`GattServerEvent::AdvertiseStarted`] or `AdvertiseFailed`
    async fn start_advertising(&self, config: &AdvertiseConfig) -> Result<(), PlatformError>;

    /// Stop advertising
    async fn stop_advertising(&self) -> Result<(), PlatformError>;

    /// Answer a client request
    async fn send_response(
        &self,
        device: &DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), PlatformError>;

    /// Push a characteristic value to one subscribed device
    async fn notify_characteristic_changed(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError>;
}
