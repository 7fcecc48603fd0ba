//! Platform bridge layer for the BLE peripheral stack
//!
//! This module provides:
//! - The [`BlePlatform`] capability trait implemented by platform-specific
//!   code (Android/iOS bindings) or the in-process loopback
//! - The [`GattServerEvent`] stream carrying inbound GATT callbacks
//! - Advertising configuration passed through to the platform

pub mod bridge;
pub mod loopback;

pub use bridge::{
    AdvertiseConfig, AdvertiseMode, BlePlatform, ConnectionState, DeviceId, GattServerEvent,
    PlatformError, TxPowerLevel,
};
pub use loopback::{LoopbackClient, LoopbackPlatform, ResponseRecord};
