//! End-to-end sync between two coordinators in one process
//!
//! Each coordinator's loopback transport holds a peer linked to the other
//! coordinator, so pairing and packages travel through the real
//! `RemoteEndpoint` path on the receiving side.

use std::sync::Arc;

use tandem_core::{
    CoordinatorDeps, CoordinatorSettings, DeviceClass, DeviceStatus, DomainProviders,
    InMemoryProvider, LoopbackPeer, LoopbackTransport, MemoryStore, SessionState, SyncCoordinator,
    SyncDomain, SyncEvent, TransportKind, TransportSet,
};
use tokio::sync::broadcast;

const KIND: TransportKind = TransportKind::ShortRangeWireless;

struct Device {
    coordinator: SyncCoordinator,
    transport: Arc<LoopbackTransport>,
    provider: Arc<InMemoryProvider>,
    store: Arc<MemoryStore>,
}

async fn device(name: &str, class: DeviceClass) -> Device {
    let transport = Arc::new(LoopbackTransport::new(KIND));
    let provider = Arc::new(InMemoryProvider::new());
    let store = Arc::new(MemoryStore::new());
    let coordinator = SyncCoordinator::new(
        CoordinatorDeps::new(
            store.clone(),
            TransportSet::new().with(transport.clone()),
            providers(&provider),
        ),
        CoordinatorSettings {
            device_class: class,
            ..Default::default()
        },
    );
    coordinator.initialize().await.unwrap();
    coordinator.set_device_name(name).await.unwrap();

    Device {
        coordinator,
        transport,
        provider,
        store,
    }
}

fn providers(provider: &Arc<InMemoryProvider>) -> DomainProviders {
    SyncDomain::ALL
        .into_iter()
        .fold(DomainProviders::new(), |p, d| p.with(d, provider.clone()))
}

/// Make each device visible to the other through its transport
fn link(a: &Device, b: &Device) {
    a.transport.add_peer(
        LoopbackPeer::new(
            b.coordinator.device_id().unwrap(),
            b.coordinator.device_name().unwrap(),
            DeviceClass::Tablet,
        )
        .linked_to(Arc::new(b.coordinator.clone())),
    );
    b.transport.add_peer(
        LoopbackPeer::new(
            a.coordinator.device_id().unwrap(),
            a.coordinator.device_name().unwrap(),
            DeviceClass::Phone,
        )
        .linked_to(Arc::new(a.coordinator.clone())),
    );
}

/// Two linked devices, with `phone` having paired with `tablet`
async fn paired_pair() -> (Device, Device) {
    let _ = tracing_subscriber::fmt::try_init();

    let phone = device("Phone", DeviceClass::Phone).await;
    let tablet = device("Tablet", DeviceClass::Tablet).await;
    link(&phone, &tablet);

    let tablet_id = tablet.coordinator.device_id().unwrap();
    phone
        .coordinator
        .pair(&tablet_id, "Tablet", KIND)
        .await
        .unwrap();
    (phone, tablet)
}

async fn wait_received(rx: &mut broadcast::Receiver<SyncEvent>) -> (String, usize) {
    loop {
        if let SyncEvent::SyncReceived {
            device_id,
            items_applied,
        } = rx.recv().await.unwrap()
        {
            return (device_id, items_applied);
        }
    }
}

async fn wait_terminal(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    loop {
        let event = rx.recv().await.unwrap();
        if event.is_session_terminal() {
            return event;
        }
    }
}

// ============================================================================
// Pairing
// ============================================================================

#[tokio::test]
async fn test_pairing_registers_both_sides() {
    let _ = tracing_subscriber::fmt::try_init();

    let phone = device("Phone", DeviceClass::Phone).await;
    let tablet = device("Tablet", DeviceClass::Tablet).await;
    link(&phone, &tablet);
    let mut tablet_rx = tablet.coordinator.subscribe();

    let tablet_id = tablet.coordinator.device_id().unwrap();
    let paired = phone
        .coordinator
        .pair(&tablet_id, "Tablet", KIND)
        .await
        .unwrap();
    assert_eq!(paired.status, DeviceStatus::Paired);
    assert_eq!(paired.device_class, DeviceClass::Tablet);

    match tablet_rx.recv().await.unwrap() {
        SyncEvent::DevicePaired { device } => {
            assert_eq!(device.id, phone.coordinator.device_id().unwrap());
            assert_eq!(device.name, "Phone");
            assert_eq!(device.device_class, DeviceClass::Phone);
            assert_eq!(device.transport_kind, KIND);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(tablet.coordinator.paired_devices().len(), 1);
}

#[tokio::test]
async fn test_pairing_survives_restart() {
    let (phone, tablet) = paired_pair().await;
    let phone_id = phone.coordinator.device_id().unwrap();
    tablet.coordinator.shutdown().await;

    let restarted = SyncCoordinator::new(
        CoordinatorDeps::new(
            tablet.store.clone(),
            TransportSet::new(),
            providers(&tablet.provider),
        ),
        CoordinatorSettings::default(),
    );
    restarted.initialize().await.unwrap();

    let devices = restarted.paired_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, phone_id);
    assert_eq!(restarted.device_name().unwrap(), "Tablet");
}

// ============================================================================
// Transfer
// ============================================================================

#[tokio::test]
async fn test_push_applies_on_receiver() {
    let (phone, tablet) = paired_pair().await;
    phone
        .provider
        .set(SyncDomain::Memory, b"met Ada at the station".to_vec());
    phone
        .provider
        .set(SyncDomain::Preferences, b"theme=dark".to_vec());
    phone
        .provider
        .set(SyncDomain::Personality, b"humor=dry".to_vec());

    let mut phone_rx = phone.coordinator.subscribe();
    let mut tablet_rx = tablet.coordinator.subscribe();
    let tablet_id = tablet.coordinator.device_id().unwrap();
    let session_id = phone.coordinator.sync_with_device(&tablet_id).unwrap();

    let (from, applied) = wait_received(&mut tablet_rx).await;
    assert_eq!(from, phone.coordinator.device_id().unwrap());
    assert_eq!(applied, 3);

    match wait_terminal(&mut phone_rx).await {
        SyncEvent::SyncCompleted { result, .. } => {
            assert!(result.bytes_sent > 0);
            assert_eq!(result.items_synced, 3);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
    let session = phone.coordinator.session_status(&session_id).unwrap();
    assert_eq!(session.status, SessionState::Completed);
    assert_eq!(session.remote_device_name, "Tablet");

    assert_eq!(
        tablet.provider.get(SyncDomain::Memory).unwrap(),
        b"met Ada at the station".to_vec()
    );
    assert_eq!(
        tablet.provider.get(SyncDomain::Preferences).unwrap(),
        b"theme=dark".to_vec()
    );

    // Both sides record the exchange
    assert_eq!(
        phone.coordinator.paired_devices()[0].status,
        DeviceStatus::Synced
    );
    let on_tablet = &tablet.coordinator.paired_devices()[0];
    assert_eq!(on_tablet.status, DeviceStatus::Synced);
    assert!(on_tablet.last_sync_time.is_some());
}

#[tokio::test]
async fn test_receiver_ignores_domains_it_disabled() {
    let (phone, tablet) = paired_pair().await;
    phone
        .provider
        .set(SyncDomain::Personality, b"curious".to_vec());
    phone.provider.set(SyncDomain::Memory, b"m".to_vec());
    tablet
        .provider
        .set(SyncDomain::Personality, b"reserved".to_vec());

    let mut config = tablet.coordinator.sync_config();
    config.sync_domains.remove(&SyncDomain::Personality);
    tablet.coordinator.update_sync_config(config).await.unwrap();

    let mut tablet_rx = tablet.coordinator.subscribe();
    let tablet_id = tablet.coordinator.device_id().unwrap();
    phone.coordinator.sync_with_device(&tablet_id).unwrap();

    let (_, applied) = wait_received(&mut tablet_rx).await;
    assert_eq!(applied, 2);
    assert_eq!(
        tablet.provider.get(SyncDomain::Personality).unwrap(),
        b"reserved".to_vec()
    );
    assert_eq!(tablet.provider.get(SyncDomain::Memory).unwrap(), b"m".to_vec());
}

#[tokio::test]
async fn test_sync_in_both_directions() {
    let (phone, tablet) = paired_pair().await;
    tablet
        .provider
        .set(SyncDomain::Preferences, b"font=large".to_vec());

    let mut phone_rx = phone.coordinator.subscribe();
    let mut tablet_rx = tablet.coordinator.subscribe();
    let phone_id = phone.coordinator.device_id().unwrap();

    // The tablet learned the pairing from the handshake and can push back
    tablet.coordinator.sync_with_device(&phone_id).unwrap();
    let (from, _) = wait_received(&mut phone_rx).await;
    assert_eq!(from, tablet.coordinator.device_id().unwrap());
    assert!(matches!(
        wait_terminal(&mut tablet_rx).await,
        SyncEvent::SyncCompleted { .. }
    ));
    assert_eq!(
        phone.provider.get(SyncDomain::Preferences).unwrap(),
        b"font=large".to_vec()
    );
}

#[tokio::test]
async fn test_push_to_device_that_unpaired_us_fails() {
    let (phone, tablet) = paired_pair().await;
    let phone_id = phone.coordinator.device_id().unwrap();
    assert!(tablet.coordinator.unpair(&phone_id).await.unwrap());

    let mut phone_rx = phone.coordinator.subscribe();
    let tablet_id = tablet.coordinator.device_id().unwrap();
    let session_id = phone.coordinator.sync_with_device(&tablet_id).unwrap();

    match wait_terminal(&mut phone_rx).await {
        SyncEvent::SyncFailed { error, .. } => {
            assert!(error.contains("remote rejected package"), "{}", error)
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
    let session = phone.coordinator.session_status(&session_id).unwrap();
    assert_eq!(session.status, SessionState::Failed);
    assert_eq!(
        phone.coordinator.paired_devices()[0].status,
        DeviceStatus::Error
    );
    assert!(tablet.provider.get(SyncDomain::Memory).is_none());
}
