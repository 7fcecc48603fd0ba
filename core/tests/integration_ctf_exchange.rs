//! End-to-End CTF Exchange Tests for BLECTF
//!
//! These tests drive the complete capture-the-flag exchange between a
//! simulated central and the peripheral:
//! 1. Advertising and service discovery
//! 2. Password characteristic reads (full and chunked)
//! 3. Name submission (immediate and prepared writes)
//! 4. CCCD subscription handling
//! 5. Flag fragment delivery over notifications
//!
//! Run with: cargo test --test integration_ctf_exchange

use blectf_core::{
    CtfServer, GattStatus, LoopbackPlatform, ServerConfig, CTF_SERVICE_UUID,
    FLAG_CHARACTERISTIC_UUID, NAME_CHARACTERISTIC_UUID, PASSWORD_CHARACTERISTIC_UUID,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn quiet_config() -> ServerConfig {
    // Rotation off so tests control every notification themselves
    ServerConfig::default().with_flag_messages(Vec::new())
}

#[tokio::test]
async fn test_full_ctf_walkthrough() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    // Test scenario: one central runs the whole challenge start to finish
    // against a live peripheral with flag rotation enabled.

    // Step 1: Bring the peripheral up with a fast rotation
    let platform = LoopbackPlatform::new();
    let config = ServerConfig::default()
        .with_password("FLAG1: h3ll0_gatt")
        .with_notify_interval(Duration::from_millis(20));
    let server = CtfServer::new(Arc::new(platform.clone()), config);
    server.start().await.expect("Failed to start server");

    // Step 2: The peripheral is advertising by device name and the CTF
    // service is registered for discovery
    assert!(platform.is_advertising());
    let advert = platform.advertising_config().expect("advertising config");
    assert!(advert.connectable);
    assert!(advert.include_device_name);
    assert!(platform.has_service(CTF_SERVICE_UUID));

    // Step 3: Connect and read the password characteristic
    let mut central = platform.client("AA:BB:CC:DD:EE:01");
    central.connect().await.expect("Failed to connect");

    let record = central
        .read(PASSWORD_CHARACTERISTIC_UUID)
        .await
        .expect("Failed to read password");
    assert_eq!(record.status, GattStatus::Success);
    assert_eq!(record.value, b"FLAG1: h3ll0_gatt");
    println!("First flag captured: {}", String::from_utf8_lossy(&record.value));

    // Step 4: Leave a name for the scoreboard
    let record = central
        .write(NAME_CHARACTERISTIC_UUID, b"alice")
        .await
        .expect("Failed to write name");
    assert_eq!(record.status, GattStatus::Success);
    assert_eq!(server.names_received(), vec!["alice".to_string()]);

    // Step 5: Subscribe to the flag characteristic
    let record = central
        .subscribe(FLAG_CHARACTERISTIC_UUID)
        .await
        .expect("Failed to subscribe");
    assert_eq!(record.status, GattStatus::Success);

    // Step 6: Collect three consecutive fragments. The central may tune in
    // mid-cycle, so check cyclic order from whichever fragment came first.
    let expected = blectf_core::default_flag_messages();
    let mut received = Vec::new();
    for _ in 0..3 {
        let (uuid, value) = timeout(Duration::from_secs(2), central.recv_notification())
            .await
            .expect("Timed out waiting for flag fragment")
            .expect("Notification channel closed");
        assert_eq!(uuid, FLAG_CHARACTERISTIC_UUID);
        received.push(String::from_utf8_lossy(&value).into_owned());
    }
    let start = expected
        .iter()
        .position(|m| *m == received[0])
        .expect("first fragment is not a known flag message");
    for (i, text) in received.iter().enumerate() {
        assert_eq!(*text, expected[(start + i) % expected.len()]);
    }
    println!("Second flag assembled from {} fragments", received.len());

    // Step 7: Unsubscribe; the feed goes quiet for this central
    let record = central
        .unsubscribe(FLAG_CHARACTERISTIC_UUID)
        .await
        .expect("Failed to unsubscribe");
    assert_eq!(record.status, GattStatus::Success);

    // Absorb any tick already in flight, then require silence
    tokio::time::sleep(Duration::from_millis(50)).await;
    while central.try_notification().is_some() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(central.try_notification().is_none());

    // Step 8: Disconnect; the scoreboard entry stays
    central.disconnect().await.expect("Failed to disconnect");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.names_received(), vec!["alice".to_string()]);

    server.stop().await;
    println!("✅ Full CTF walkthrough passed: both flags captured");
}

#[tokio::test]
async fn test_password_read_in_mtu_sized_chunks() {
    // Test scenario: a small-MTU central reads the password in 8-byte
    // slices using offset reads and reassembles the full value.

    let platform = LoopbackPlatform::new();
    let server = CtfServer::new(
        Arc::new(platform.clone()),
        quiet_config().with_password("FLAG1: h3ll0_gatt"),
    );
    server.start().await.expect("Failed to start server");

    let central = platform.client("AA:BB:CC:DD:EE:02");
    central.connect().await.expect("Failed to connect");

    // Step 1: Walk the value with offset reads until a slice comes up empty
    let mut assembled = Vec::new();
    let mut offset = 0u16;
    loop {
        let record = central
            .read_at(PASSWORD_CHARACTERISTIC_UUID, offset)
            .await
            .expect("Failed to read at offset");
        assert_eq!(record.status, GattStatus::Success);
        assert_eq!(record.offset, offset);
        if record.value.is_empty() {
            break;
        }
        let chunk = &record.value[..record.value.len().min(8)];
        assembled.extend_from_slice(chunk);
        offset += chunk.len() as u16;
    }

    // Step 2: The reassembled slices equal the full password
    assert_eq!(assembled, b"FLAG1: h3ll0_gatt");

    // Step 3: A read past the end still succeeds with an empty payload
    let record = central
        .read_at(PASSWORD_CHARACTERISTIC_UUID, 500)
        .await
        .expect("Failed to read past end");
    assert_eq!(record.status, GattStatus::Success);
    assert!(record.value.is_empty());

    server.stop().await;
    println!("✅ Chunked read test passed: password reassembled from offset reads");
}

#[tokio::test]
async fn test_long_name_assembled_from_prepared_writes() {
    // Test scenario: a central whose name exceeds the MTU sends it as
    // prepared-write fragments and commits them with an execute.

    let platform = LoopbackPlatform::new();
    let server = CtfServer::new(Arc::new(platform.clone()), quiet_config());
    server.start().await.expect("Failed to start server");

    let central = platform.client("AA:BB:CC:DD:EE:03");
    central.connect().await.expect("Failed to connect");

    // Step 1: Queue three fragments under one request id
    let record = central
        .prepare_write(42, NAME_CHARACTERISTIC_UUID, 0, b"Lady ")
        .await
        .expect("Failed to prepare fragment 1");
    assert_eq!(record.status, GattStatus::Success);
    assert_eq!(record.offset, 0);
    assert_eq!(record.value, b"Lady ");

    let record = central
        .prepare_write(42, NAME_CHARACTERISTIC_UUID, 5, b"Ada ")
        .await
        .expect("Failed to prepare fragment 2");
    assert_eq!(record.offset, 5);

    let record = central
        .prepare_write(42, NAME_CHARACTERISTIC_UUID, 9, b"Lovelace")
        .await
        .expect("Failed to prepare fragment 3");
    assert_eq!(record.offset, 9);

    // Step 2: Nothing lands on the scoreboard until the execute
    assert!(server.names_received().is_empty());

    // Step 3: Execute commits the assembled name
    let record = central.execute_write(42).await.expect("Failed to execute");
    assert_eq!(record.status, GattStatus::Success);
    assert_eq!(server.names_received(), vec!["Lady Ada Lovelace".to_string()]);

    server.stop().await;
    println!("✅ Prepared write test passed: long name assembled across fragments");
}

#[tokio::test]
async fn test_cancelled_prepared_write_leaves_no_name() {
    // Test scenario: a central abandons a prepared write; the queued
    // fragments must vanish without touching the scoreboard.

    let platform = LoopbackPlatform::new();
    let server = CtfServer::new(Arc::new(platform.clone()), quiet_config());
    server.start().await.expect("Failed to start server");

    let central = platform.client("AA:BB:CC:DD:EE:04");
    central.connect().await.expect("Failed to connect");

    // Step 1: Queue fragments, then cancel instead of executing
    central
        .prepare_write(7, NAME_CHARACTERISTIC_UUID, 0, b"mal")
        .await
        .expect("Failed to prepare");
    central
        .prepare_write(7, NAME_CHARACTERISTIC_UUID, 3, b"lory")
        .await
        .expect("Failed to prepare");

    let record = central.cancel_write(7).await.expect("Failed to cancel");
    assert_eq!(record.status, GattStatus::Success);
    assert!(server.names_received().is_empty());

    // Step 2: A later execute under the same id finds nothing to commit
    let record = central.execute_write(7).await.expect("Failed to execute");
    assert_eq!(record.status, GattStatus::Success);
    assert!(server.names_received().is_empty());

    server.stop().await;
    println!("✅ Cancel test passed: abandoned fragments left no trace");
}

#[tokio::test]
async fn test_misbehaving_central_gets_failures() {
    // Test scenario: a central pokes at everything it should not touch.
    // Every bad request gets a clean failure and the server keeps serving.

    let platform = LoopbackPlatform::new();
    let server = CtfServer::new(Arc::new(platform.clone()), quiet_config());
    server.start().await.expect("Failed to start server");

    let central = platform.client("AA:BB:CC:DD:EE:05");
    central.connect().await.expect("Failed to connect");

    // Step 1: Writing the read-only password characteristic fails
    let record = central
        .write(PASSWORD_CHARACTERISTIC_UUID, b"overwrite attempt")
        .await
        .expect("Request failed to round-trip");
    assert_eq!(record.status, GattStatus::Failure);

    // Step 2: Reading the write-only name characteristic fails
    let record = central
        .read(NAME_CHARACTERISTIC_UUID)
        .await
        .expect("Request failed to round-trip");
    assert_eq!(record.status, GattStatus::Failure);

    // Step 3: An unknown characteristic fails
    let bogus = uuid::Uuid::new_v4();
    let record = central.read(bogus).await.expect("Request failed to round-trip");
    assert_eq!(record.status, GattStatus::Failure);

    // Step 4: A malformed CCCD value is rejected
    let record = central
        .write_descriptor(
            FLAG_CHARACTERISTIC_UUID,
            blectf_core::CCCD_UUID,
            &[0x01, 0x01],
        )
        .await
        .expect("Request failed to round-trip");
    assert_eq!(record.status, GattStatus::Failure);

    // Step 5: Subscribing to a characteristic with no CCCD is rejected
    let record = central
        .subscribe(PASSWORD_CHARACTERISTIC_UUID)
        .await
        .expect("Request failed to round-trip");
    assert_eq!(record.status, GattStatus::Failure);

    // Step 6: The server still answers the legitimate flow
    let record = central
        .read(PASSWORD_CHARACTERISTIC_UUID)
        .await
        .expect("Failed to read password");
    assert_eq!(record.status, GattStatus::Success);
    assert_eq!(record.value, blectf_core::DEFAULT_PASSWORD.as_bytes());

    server.stop().await;
    println!("✅ Misbehaving central test passed: bad requests fail cleanly");
}

#[tokio::test]
async fn test_two_centrals_share_flag_feed() {
    // Test scenario: Alice and Bob both subscribe; Bob drops off and only
    // Alice keeps receiving.

    let platform = LoopbackPlatform::new();
    let server = CtfServer::new(Arc::new(platform.clone()), quiet_config());
    server.start().await.expect("Failed to start server");

    let mut alice = platform.client("AA:BB:CC:DD:EE:0A");
    let mut bob = platform.client("AA:BB:CC:DD:EE:0B");
    alice.connect().await.expect("Failed to connect alice");
    bob.connect().await.expect("Failed to connect bob");

    // Step 1: Both subscribe and both receive the first push
    alice
        .subscribe(FLAG_CHARACTERISTIC_UUID)
        .await
        .expect("Failed to subscribe alice");
    bob.subscribe(FLAG_CHARACTERISTIC_UUID)
        .await
        .expect("Failed to subscribe bob");

    let delivered = server
        .send_notification("round one")
        .await
        .expect("Failed to notify");
    assert_eq!(delivered, 2);

    let (_, value) = alice.recv_notification().await.expect("alice notification");
    assert_eq!(value, b"round one");
    let (_, value) = bob.recv_notification().await.expect("bob notification");
    assert_eq!(value, b"round one");

    // Step 2: Bob disconnects; his subscription is gone with him
    bob.disconnect().await.expect("Failed to disconnect bob");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let delivered = server
        .send_notification("round two")
        .await
        .expect("Failed to notify");
    assert_eq!(delivered, 1);

    let (_, value) = alice.recv_notification().await.expect("alice notification");
    assert_eq!(value, b"round two");
    assert!(bob.try_notification().is_none());

    server.stop().await;
    println!("✅ Multi-central test passed: feed follows live subscriptions");
}
