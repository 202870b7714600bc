use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, Notify};

use super::*;
use crate::protocol::{Packet, Publish, QoS};
use crate::session::{EngineConfig, Role, SessionEngine, SessionParams};
use crate::store::MemoryStore;

fn attach(session: &Arc<Session>, id: u64) -> (ConnectionHandle, mpsc::Receiver<Packet>) {
    attach_with_capacity(session, id, 16)
}

fn attach_with_capacity(
    session: &Arc<Session>,
    id: u64,
    capacity: usize,
) -> (ConnectionHandle, mpsc::Receiver<Packet>) {
    let mut engine = SessionEngine::new(
        Role::Broker,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        EngineConfig::default(),
    );
    engine
        .establish(
            SessionParams {
                keep_alive: 0,
                clean_session: session.is_clean(),
                incoming: session.incoming(),
                outgoing: session.outgoing(),
            },
            Instant::now(),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel(capacity);
    let handle = ConnectionHandle {
        id,
        engine: Arc::new(Mutex::new(engine)),
        outbound: tx,
        closer: Arc::new(Notify::new()),
    };
    (handle, rx)
}

fn expect_publish(rx: &mut mpsc::Receiver<Packet>) -> Publish {
    match rx.try_recv() {
        Ok(Packet::Publish(p)) => p,
        other => panic!("expected publish, got {:?}", other),
    }
}

#[tokio::test]
async fn test_allow_everyone_by_default() {
    let backend = MemoryBackend::new();
    assert!(backend.authenticate("c", None, None).await.unwrap());
}

#[tokio::test]
async fn test_login_table() {
    let backend = MemoryBackend::new().with_logins(Logins::new().with_user("allow", "allow"));

    assert!(backend
        .authenticate("c", Some("allow"), Some(b"allow"))
        .await
        .unwrap());
    assert!(!backend
        .authenticate("c", Some("allow"), Some(b"wrong"))
        .await
        .unwrap());
    assert!(!backend
        .authenticate("c", Some("nobody"), Some(b"allow"))
        .await
        .unwrap());
    assert!(!backend.authenticate("c", None, None).await.unwrap());
}

#[test]
fn test_anonymous_logins() {
    let logins = Logins::new().allow_anonymous(true);
    assert!(logins.check(None, None));
    assert!(!logins.check(Some("user"), None));
}

#[tokio::test]
async fn test_setup_fresh_and_resume() {
    let backend = MemoryBackend::new();

    let (first, present) = backend.setup("c1", false).await.unwrap();
    assert!(!present);

    let (second, present) = backend.setup("c1", false).await.unwrap();
    assert!(present);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(backend.session_count(), 1);
}

#[tokio::test]
async fn test_setup_clean_replaces_session() {
    let backend = MemoryBackend::new();

    let (first, _) = backend.setup("c1", false).await.unwrap();
    backend.subscribe(&first, "a/#", QoS::AtLeastOnce).await.unwrap();

    let (second, present) = backend.setup("c1", true).await.unwrap();
    assert!(!present);
    assert!(!Arc::ptr_eq(&first, &second));

    // Old subscriptions no longer route
    backend
        .publish(Publish::new("a/b", "x", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(first.queued_len(), 0);
    assert_eq!(second.queued_len(), 0);
}

#[tokio::test]
async fn test_resume_of_clean_session_is_fresh() {
    let backend = MemoryBackend::new();

    let (first, _) = backend.setup("c1", true).await.unwrap();
    let (second, present) = backend.setup("c1", false).await.unwrap();
    assert!(!present);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_publish_reaches_attached_connection() {
    let backend = MemoryBackend::new();
    let (session, _) = backend.setup("sub", true).await.unwrap();
    let (handle, mut rx) = attach(&session, 1);
    session.attach(handle);

    assert_eq!(
        backend.subscribe(&session, "test", QoS::AtLeastOnce).await.unwrap(),
        QoS::AtLeastOnce
    );
    backend
        .publish(Publish::new("test", "payload", QoS::ExactlyOnce))
        .await
        .unwrap();

    let publish = expect_publish(&mut rx);
    assert_eq!(&*publish.topic, "test");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.packet_id.is_some());
    assert!(!publish.retain);
    assert_eq!(session.outgoing().len().unwrap(), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_routing() {
    let backend = MemoryBackend::new();
    let (session, _) = backend.setup("sub", true).await.unwrap();
    let (handle, mut rx) = attach(&session, 1);
    session.attach(handle);

    backend.subscribe(&session, "foo", QoS::AtMostOnce).await.unwrap();
    backend.unsubscribe(&session, "foo").await.unwrap();
    assert!(session.subscriptions().is_empty());

    backend
        .publish(Publish::new("foo", "x", QoS::AtMostOnce))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_offline_queue_for_persistent_session() {
    let backend = MemoryBackend::new().with_limits(BackendLimits {
        max_queued_messages: 2,
        ..Default::default()
    });
    let (session, _) = backend.setup("c1", false).await.unwrap();
    backend.subscribe(&session, "t", QoS::ExactlyOnce).await.unwrap();

    for payload in ["1", "2", "3"] {
        backend
            .publish(Publish::new("t", payload, QoS::AtLeastOnce))
            .await
            .unwrap();
    }
    // QoS 0 is not queued
    backend
        .publish(Publish::new("t", "4", QoS::AtMostOnce))
        .await
        .unwrap();

    assert_eq!(session.queued_len(), 2);

    let (handle, _rx) = attach(&session, 1);
    let queued = session.attach(handle);
    let payloads: Vec<_> = queued.iter().map(|p| p.payload.clone()).collect();
    assert_eq!(payloads, vec!["2", "3"]);
    assert_eq!(session.queued_len(), 0);
}

#[tokio::test]
async fn test_attach_closes_previous_connection() {
    let backend = MemoryBackend::new();
    let (session, _) = backend.setup("c1", false).await.unwrap();

    let (first, _first_rx) = attach(&session, 1);
    let first_closer = first.closer.clone();
    session.attach(first);
    let (second, _second_rx) = attach(&session, 2);
    session.attach(second);

    tokio::time::timeout(Duration::from_secs(1), first_closer.notified())
        .await
        .expect("previous connection not closed");

    // The replaced connection can no longer detach the session
    assert!(!session.detach(1));
    assert!(session.is_attached());
    assert!(session.detach(2));
}

#[tokio::test]
async fn test_full_outbound_queue_applies_backpressure() {
    let backend = Arc::new(MemoryBackend::new());
    let (session, _) = backend.setup("sub", true).await.unwrap();
    let (handle, mut rx) = attach_with_capacity(&session, 1, 1);
    session.attach(handle);
    backend.subscribe(&session, "t", QoS::AtLeastOnce).await.unwrap();

    let publisher = backend.clone();
    let publishing = tokio::spawn(async move {
        for i in 0..20 {
            let payload = i.to_string();
            publisher
                .publish(Publish::new("t", payload, QoS::AtLeastOnce))
                .await
                .unwrap();
        }
    });

    let mut payloads = Vec::new();
    while payloads.len() < 20 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Packet::Publish(p))) => payloads.push(p.payload),
            other => panic!("expected publish, got {:?}", other),
        }
    }
    publishing.await.unwrap();

    let expected: Vec<_> = (0..20).map(|i| bytes::Bytes::from(i.to_string())).collect();
    assert_eq!(payloads, expected);
    assert_eq!(session.outgoing().len().unwrap(), 20);
}

#[tokio::test]
async fn test_stalled_outbound_queue_closes_connection() {
    let backend = MemoryBackend::new().with_limits(BackendLimits {
        delivery_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let (session, _) = backend.setup("sub", false).await.unwrap();
    let (handle, _rx) = attach_with_capacity(&session, 1, 1);
    let closer = handle.closer.clone();
    session.attach(handle);
    backend.subscribe(&session, "t", QoS::AtLeastOnce).await.unwrap();

    for payload in ["fits", "stalls"] {
        backend
            .publish(Publish::new("t", payload, QoS::AtLeastOnce))
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(1), closer.notified())
        .await
        .expect("stalled connection not closed");
    // Both copies stay pending for the next connection to resend
    assert_eq!(session.outgoing().len().unwrap(), 2);
}

#[tokio::test]
async fn test_terminate_unattached_clean_session() {
    let backend = MemoryBackend::new();
    let (session, _) = backend.setup("c1", true).await.unwrap();
    backend.subscribe(&session, "a", QoS::AtMostOnce).await.unwrap();

    backend.terminate(&session, 3).await.unwrap();
    assert_eq!(backend.session_count(), 0);
}

#[tokio::test]
async fn test_terminate_clean_session() {
    let backend = MemoryBackend::new();
    let (session, _) = backend.setup("c1", true).await.unwrap();
    let (handle, _rx) = attach(&session, 7);
    session.attach(handle);
    backend.subscribe(&session, "a", QoS::AtMostOnce).await.unwrap();

    backend.terminate(&session, 7).await.unwrap();
    assert_eq!(backend.session_count(), 0);
    assert!(backend.session("c1").is_none());
}

#[tokio::test]
async fn test_terminate_persistent_session_keeps_it() {
    let backend = MemoryBackend::new();
    let (session, _) = backend.setup("c1", false).await.unwrap();
    let (handle, _rx) = attach(&session, 7);
    session.attach(handle);
    backend.subscribe(&session, "a", QoS::AtLeastOnce).await.unwrap();

    backend.terminate(&session, 7).await.unwrap();
    assert!(!session.is_attached());
    assert_eq!(backend.session_count(), 1);
    assert_eq!(session.subscriptions(), vec![("a".to_string(), QoS::AtLeastOnce)]);

    backend
        .publish(Publish::new("a", "later", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(session.queued_len(), 1);
}

#[tokio::test]
async fn test_terminate_stale_connection_is_noop() {
    let backend = MemoryBackend::new();
    let (old, _) = backend.setup("c1", true).await.unwrap();
    let (handle, _rx) = attach(&old, 1);
    old.attach(handle);

    let (new, _) = backend.setup("c1", true).await.unwrap();
    backend.subscribe(&new, "a", QoS::AtMostOnce).await.unwrap();

    backend.terminate(&old, 1).await.unwrap();
    assert!(Arc::ptr_eq(&backend.session("c1").unwrap(), &new));
    assert_eq!(new.subscriptions().len(), 1);
}

#[tokio::test]
async fn test_retained_messages() {
    let backend = MemoryBackend::new();

    let mut publish = Publish::new("sensors/1", "on", QoS::AtLeastOnce);
    publish.retain = true;
    backend.publish(publish.clone()).await.unwrap();
    assert_eq!(backend.retained_count(), 1);

    let retained = backend.retained_for("sensors/+").await.unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(&*retained[0].topic, "sensors/1");

    publish.payload = bytes::Bytes::new();
    backend.publish(publish).await.unwrap();
    assert_eq!(backend.retained_count(), 0);
}
