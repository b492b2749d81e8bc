//! Event multiplexing across proxies
//!
//! Many watchers of one server should cost as few remote subscriptions as
//! possible, and every subscription must be gone once its watchers are.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use virtmgmt::proxy::ModificationStrategy;
use virtmgmt::session::mock::{MockOp, MockSession};
use virtmgmt::{ModelConfig, ObjectLocator, Server, ViewFactory};
use virtmgmt_core_interface::{Credential, Instance, ObjectPath};

const NS: &str = "root\\virtualization\\v2";

fn setting(id: &str, quantity: u64) -> Instance {
    Instance::new("HOST01", NS, "Msvm_MemorySettingData")
        .with_key("InstanceID", id)
        .with_property("ElementName", "Memory")
        .with_property("VirtualQuantity", quantity)
}

fn locator(session: &MockSession) -> ObjectLocator {
    virtmgmt::logging::init_test_logging();
    Arc::new(Server::new(
        Arc::new(session.clone()),
        Credential::Current,
        Arc::new(ModelConfig::default()),
        ViewFactory::with_defaults(),
    ))
    .locator()
}

async fn quantity_becomes(locator: &ObjectLocator, path: &ObjectPath, expected: u64) -> bool {
    let proxy = locator.get_proxy(path).await.unwrap();
    for _ in 0..200 {
        let current = proxy
            .cached_property("VirtualQuantity")
            .ok()
            .flatten()
            .and_then(|v| v.as_u64());
        if current == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_bulk_watchers_share_one_class_subscription() {
    let session = MockSession::new("HOST01")
        .with_instance(setting("A", 1024))
        .with_instance(setting("B", 2048));
    let locator = locator(&session);
    let a = locator.get_proxy(&setting("A", 0).path()).await.unwrap();
    let b = locator.get_proxy(&setting("B", 0).path()).await.unwrap();

    let sub_a = a
        .register_modification_events(ModificationStrategy::Bulk)
        .await
        .unwrap();
    let sub_b = b
        .register_modification_events(ModificationStrategy::Bulk)
        .await
        .unwrap();
    assert_eq!(session.calls(MockOp::Subscribe), 1);

    session.update_and_emit(setting("B", 4096));
    assert!(quantity_becomes(&locator, &setting("B", 0).path(), 4096).await);
    assert_eq!(
        a.cached_property("VirtualQuantity").unwrap().and_then(|v| v.as_u64()),
        Some(1024)
    );

    sub_a.release().await;
    assert_eq!(session.active_subscriptions().len(), 1);
    sub_b.release().await;
    assert!(session.active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_repeated_registrations_are_reference_counted() {
    let session = MockSession::new("HOST01").with_instance(setting("A", 1024));
    let locator = locator(&session);
    let proxy = locator.get_proxy(&setting("A", 0).path()).await.unwrap();

    let first = proxy
        .register_modification_events(ModificationStrategy::PerInstance)
        .await
        .unwrap();
    let second = proxy
        .register_modification_events(ModificationStrategy::PerInstance)
        .await
        .unwrap();
    assert_eq!(session.subscribe_count(), 1);

    first.release().await;
    first.release().await;
    assert_eq!(session.unsubscribe_count(), 0);

    session.update_and_emit(setting("A", 512));
    assert!(quantity_becomes(&locator, &setting("A", 0).path(), 512).await);

    second.release().await;
    assert_eq!(session.unsubscribe_count(), 1);
}

#[tokio::test]
async fn test_deletion_event_reaches_every_watcher_once() {
    let session = MockSession::new("HOST01").with_instance(setting("A", 1024));
    let locator = locator(&session);
    let path = setting("A", 0).path();
    let proxy = locator.get_proxy(&path).await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let mut subs = Vec::new();
    for _ in 0..2 {
        let counter = fired.clone();
        subs.push(
            proxy
                .on_deleted(Arc::new(move |_: &ObjectPath| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .await
                .unwrap(),
        );
    }
    assert_eq!(session.subscribe_count(), 1);

    assert_eq!(session.delete_and_emit(&path), 1);
    for _ in 0..200 {
        if proxy.is_deleted() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(proxy.is_deleted());
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(!locator.server().repository().contains(&path));

    for sub in &subs {
        sub.release().await;
    }
    assert!(session.active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_closing_server_drops_all_subscriptions() {
    let session = MockSession::new("HOST01")
        .with_instance(setting("A", 1024))
        .with_instance(setting("B", 2048));
    let locator = locator(&session);
    let a = locator.get_proxy(&setting("A", 0).path()).await.unwrap();
    let b = locator.get_proxy(&setting("B", 0).path()).await.unwrap();

    let _bulk = a
        .register_modification_events(ModificationStrategy::Bulk)
        .await
        .unwrap();
    let _per_instance = b
        .register_modification_events(ModificationStrategy::PerInstance)
        .await
        .unwrap();
    assert_eq!(session.active_subscriptions().len(), 2);

    locator.server().close().await;
    assert!(session.active_subscriptions().is_empty());
    assert!(locator.server().repository().is_empty());
}
