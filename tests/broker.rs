//! Broker integration tests
//!
//! Each test serves a broker on an ephemeral port and talks to it with a
//! packet-level test client, so every byte on the wire is under the
//! test's control.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use relaymq::backend::{Logins, MemoryBackend};
use relaymq::broker::{Broker, BrokerConfig};
use relaymq::codec::{Decoder, Encoder};
use relaymq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Subscription, Unsubscribe, Will,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_broker(config: BrokerConfig, backend: MemoryBackend) -> (Broker, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Broker::with_backend(config, Arc::new(backend));

    let server = broker.clone();
    tokio::spawn(async move { server.serve(listener).await });
    (broker, addr)
}

async fn start_default_broker() -> (Broker, SocketAddr) {
    start_broker(BrokerConfig::default(), MemoryBackend::new()).await
}

fn connect_packet(client_id: &str, clean_session: bool, keep_alive: u16) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        ..Default::default()
    }
}

/// Packet-level MQTT client
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Next packet, or `None` on EOF / timeout
    async fn recv_within(&mut self, limit: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).expect("Failed to decode") {
                let _ = self.buf.split_to(consumed);
                return Some(packet);
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(RECV_TIMEOUT).await
    }

    /// Wait for the broker to close the connection; panics on any packet
    async fn expect_closed(&mut self) {
        let mut scratch = [0u8; 256];
        match timeout(RECV_TIMEOUT, self.stream.read(&mut scratch)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => panic!("Expected close, got {} bytes", n),
            Err(_) => panic!("Connection was not closed"),
        }
    }

    async fn handshake(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.handshake(connect_packet(client_id, clean_session, 60)).await
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription::new(filter, qos)],
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) {
        let mut publish = Publish::new(topic, Bytes::from_static(payload), qos);
        publish.packet_id = packet_id;
        self.send(&Packet::Publish(publish)).await;
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_connect_accepted() {
    let (_broker, addr) = start_default_broker().await;
    let mut client = TestClient::connect(addr).await;

    let connack = client.mqtt_connect("accepted", true).await;
    assert_eq!(connack, ConnAck::new(ConnectReturnCode::Accepted, false));

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_connect_timeout_closes_silently() {
    let config = BrokerConfig {
        connect_timeout: Duration::from_millis(10),
        ..Default::default()
    };
    let (_broker, addr) = start_broker(config, MemoryBackend::new()).await;

    let start = Instant::now();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection not closed after connect timeout")
        .unwrap_or(0);

    assert_eq!(n, 0, "broker must not reply before CONNECT");
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[tokio::test]
async fn test_allow_login_accepted() {
    let backend = MemoryBackend::new().with_logins(Logins::new().with_user("allow", "allow"));
    let (_broker, addr) = start_broker(BrokerConfig::default(), backend).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client
        .handshake(Connect {
            client_id: "allowed".to_string(),
            username: Some("allow".to_string()),
            password: Some(Bytes::from_static(b"allow")),
            ..Default::default()
        })
        .await;

    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);
}

#[tokio::test]
async fn test_wrong_credentials_refused_then_closed() {
    let backend = MemoryBackend::new().with_logins(Logins::new().with_user("allow", "allow"));
    let (_broker, addr) = start_broker(BrokerConfig::default(), backend).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client
        .handshake(Connect {
            client_id: "denied".to_string(),
            username: Some("allow".to_string()),
            password: Some(Bytes::from_static(b"deny")),
            ..Default::default()
        })
        .await;

    assert_eq!(connack.return_code, ConnectReturnCode::NotAuthorized);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_anonymous_refused_when_logins_required() {
    let backend = MemoryBackend::new().with_logins(Logins::new().with_user("allow", "allow"));
    let (_broker, addr) = start_broker(BrokerConfig::default(), backend).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("anonymous", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::NotAuthorized);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_unsupported_protocol_level() {
    let (_broker, addr) = start_default_broker().await;
    let mut client = TestClient::connect(addr).await;

    let connack = client
        .handshake(Connect {
            protocol_level: 5,
            client_id: "future".to_string(),
            ..Default::default()
        })
        .await;

    assert_eq!(
        connack.return_code,
        ConnectReturnCode::UnacceptableProtocolVersion
    );
    client.expect_closed().await;
}

#[tokio::test]
async fn test_empty_client_id() {
    let (_broker, addr) = start_default_broker().await;

    let mut persistent = TestClient::connect(addr).await;
    let connack = persistent.mqtt_connect("", false).await;
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    persistent.expect_closed().await;

    let mut clean = TestClient::connect(addr).await;
    let connack = clean.mqtt_connect("", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (_broker, addr) = start_default_broker().await;
    let mut client = TestClient::connect(addr).await;

    client.send(&Packet::PingReq).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn test_keep_alive_timeout() {
    let (_broker, addr) = start_default_broker().await;
    let mut client = TestClient::connect(addr).await;

    let start = Instant::now();
    let connack = client.handshake(connect_packet("silent", true, 1)).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    client.expect_closed().await;
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1450),
        "closed too early: {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_pings_keep_connection_alive() {
    let (_broker, addr) = start_default_broker().await;
    let mut client = TestClient::connect(addr).await;

    let connack = client.handshake(connect_packet("pinger", true, 1)).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(700)).await;
        client.send(&Packet::PingReq).await;
        assert_eq!(client.recv().await, Some(Packet::PingResp));
    }
}

#[tokio::test]
async fn test_qos1_publish_subscribe() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("qos1-sub", true).await;
    let suback = subscriber.subscribe(1, "test", QoS::AtLeastOnce).await;
    assert_eq!(suback.return_codes, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("qos1-pub", true).await;
    publisher.publish("test", b"test", QoS::AtLeastOnce, Some(7)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(7)));

    let publish = subscriber.recv_publish().await;
    assert_eq!(&*publish.topic, "test");
    assert_eq!(publish.payload, Bytes::from_static(b"test"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
    assert!(!publish.retain);

    let packet_id = publish.packet_id.expect("QoS 1 delivery without packet id");
    subscriber.send(&Packet::PubAck(packet_id)).await;

    // Nothing else arrives
    assert_eq!(subscriber.recv_within(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_qos2_publish_subscribe() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("qos2-sub", true).await;
    subscriber.subscribe(1, "test", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("qos2-pub", true).await;
    publisher.publish("test", b"once", QoS::ExactlyOnce, Some(3)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(3)));

    // A duplicate before PUBREL is acknowledged but not routed again
    let mut dup = Publish::new("test", Bytes::from_static(b"once"), QoS::ExactlyOnce);
    dup.packet_id = Some(3);
    dup.dup = true;
    publisher.send(&Packet::Publish(dup)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(3)));

    publisher.send(&Packet::PubRel(3)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(3)));

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    assert_eq!(publish.payload, Bytes::from_static(b"once"));
    let packet_id = publish.packet_id.unwrap();

    subscriber.send(&Packet::PubRec(packet_id)).await;
    assert_eq!(subscriber.recv().await, Some(Packet::PubRel(packet_id)));
    subscriber.send(&Packet::PubComp(packet_id)).await;

    assert_eq!(subscriber.recv_within(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_qos_downgraded_to_subscription() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("downgrade-sub", true).await;
    subscriber.subscribe(1, "sensors/+", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("downgrade-pub", true).await;
    publisher.publish("sensors/temp", b"21", QoS::ExactlyOnce, Some(1)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(1)));

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("unsub", true).await;
    subscriber.subscribe(1, "foo", QoS::AtMostOnce).await;

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["foo".to_string()],
        }))
        .await;
    assert_eq!(subscriber.recv().await, Some(Packet::UnsubAck(2)));
    subscriber.subscribe(3, "test", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("unsub-pub", true).await;
    publisher.publish("foo", b"ignored", QoS::AtMostOnce, None).await;
    publisher.publish("test", b"delivered", QoS::AtMostOnce, None).await;

    let publish = subscriber.recv_publish().await;
    assert_eq!(&*publish.topic, "test");
    assert_eq!(publish.payload, Bytes::from_static(b"delivered"));
}

#[tokio::test]
async fn test_invalid_filter_gets_failure_code() {
    let (_broker, addr) = start_default_broker().await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("bad-filter", true).await;

    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 5,
            subscriptions: vec![
                Subscription::new("a/#/b", QoS::AtLeastOnce),
                Subscription::new("a/+", QoS::AtLeastOnce),
            ],
        }))
        .await;

    match client.recv().await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(ack.packet_id, 5);
            assert_eq!(
                ack.return_codes,
                vec![
                    SubscribeReturnCode::Failure,
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                ]
            );
        }
        other => panic!("Expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_retained_message_replayed_on_subscribe() {
    let (_broker, addr) = start_default_broker().await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("retain-pub", true).await;
    let mut publish = Publish::new("status/door", Bytes::from_static(b"open"), QoS::AtLeastOnce);
    publish.packet_id = Some(1);
    publish.retain = true;
    publisher.send(&Packet::Publish(publish)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("retain-sub", true).await;
    subscriber.subscribe(1, "status/+", QoS::AtMostOnce).await;

    let replay = subscriber.recv_publish().await;
    assert_eq!(&*replay.topic, "status/door");
    assert_eq!(replay.payload, Bytes::from_static(b"open"));
    assert_eq!(replay.qos, QoS::AtMostOnce);
    assert!(replay.retain);
}

#[tokio::test]
async fn test_will_published_on_abnormal_close() {
    let (_broker, addr) = start_default_broker().await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("will-watcher", true).await;
    watcher.subscribe(1, "clients/+/status", QoS::AtMostOnce).await;

    let mut doomed = TestClient::connect(addr).await;
    let connack = doomed
        .handshake(Connect {
            client_id: "doomed".to_string(),
            will: Some(Will {
                topic: "clients/doomed/status".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    drop(doomed);

    let will = watcher.recv_publish().await;
    assert_eq!(&*will.topic, "clients/doomed/status");
    assert_eq!(will.payload, Bytes::from_static(b"offline"));
}

#[tokio::test]
async fn test_will_discarded_on_disconnect() {
    let (_broker, addr) = start_default_broker().await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("quiet-watcher", true).await;
    watcher.subscribe(1, "clients/#", QoS::AtMostOnce).await;

    let mut polite = TestClient::connect(addr).await;
    polite
        .handshake(Connect {
            client_id: "polite".to_string(),
            will: Some(Will {
                topic: "clients/polite/status".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    polite.send(&Packet::Disconnect).await;
    polite.expect_closed().await;

    assert_eq!(watcher.recv_within(Duration::from_millis(300)).await, None);
}

#[tokio::test]
async fn test_takeover_closes_previous_connection() {
    let (_broker, addr) = start_default_broker().await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("twin", true).await;

    let mut second = TestClient::connect(addr).await;
    let connack = second.mqtt_connect("twin", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    first.expect_closed().await;

    second.send(&Packet::PingReq).await;
    assert_eq!(second.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_persistent_session_receives_queued_messages() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    let connack = subscriber.mqtt_connect("durable", false).await;
    assert!(!connack.session_present);
    subscriber.subscribe(1, "jobs/#", QoS::AtLeastOnce).await;
    subscriber.send(&Packet::Disconnect).await;
    subscriber.expect_closed().await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("jobs-pub", true).await;
    publisher.publish("jobs/1", b"build", QoS::AtLeastOnce, Some(1)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    let mut resumed = TestClient::connect(addr).await;
    let connack = resumed.mqtt_connect("durable", false).await;
    assert!(connack.session_present);

    let publish = resumed.recv_publish().await;
    assert_eq!(&*publish.topic, "jobs/1");
    assert_eq!(publish.payload, Bytes::from_static(b"build"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_slow_subscriber_receives_every_message() {
    let config = BrokerConfig {
        outbound_capacity: 1,
        ..Default::default()
    };
    let (_broker, addr) = start_broker(config, MemoryBackend::new()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("slow-sub", true).await;
    subscriber.subscribe(1, "t", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("fast-pub", true).await;
    for packet_id in 1..=50u16 {
        let mut publish = Publish::new("t", Bytes::from(packet_id.to_string()), QoS::AtLeastOnce);
        publish.packet_id = Some(packet_id);
        publisher.send(&Packet::Publish(publish)).await;
        assert_eq!(publisher.recv().await, Some(Packet::PubAck(packet_id)));
    }

    for expected in 1..=50u16 {
        let publish = subscriber.recv_publish().await;
        assert_eq!(publish.payload, Bytes::from(expected.to_string()));
        subscriber.send(&Packet::PubAck(publish.packet_id.unwrap())).await;
    }
    assert_eq!(subscriber.recv_within(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_unacknowledged_qos1_resent_on_resume() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("resume-qos1", false).await;
    subscriber.subscribe(1, "orders", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("orders-pub", true).await;
    publisher.publish("orders", b"first", QoS::AtLeastOnce, Some(1)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(1)));

    // Received but never acknowledged
    let original = subscriber.recv_publish().await;
    assert!(!original.dup);
    drop(subscriber);

    let mut resumed = TestClient::connect(addr).await;
    let connack = resumed.mqtt_connect("resume-qos1", false).await;
    assert!(connack.session_present);

    let redelivered = resumed.recv_publish().await;
    assert!(redelivered.dup);
    assert_eq!(redelivered.packet_id, original.packet_id);
    assert_eq!(redelivered.payload, Bytes::from_static(b"first"));
    resumed.send(&Packet::PubAck(redelivered.packet_id.unwrap())).await;

    publisher.publish("orders", b"second", QoS::AtLeastOnce, Some(2)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(2)));
    let next = resumed.recv_publish().await;
    assert!(!next.dup);
    assert_eq!(next.payload, Bytes::from_static(b"second"));
}

#[tokio::test]
async fn test_qos2_release_resent_on_resume() {
    let (_broker, addr) = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("resume-qos2", false).await;
    subscriber.subscribe(1, "ledger", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("ledger-pub", true).await;
    publisher.publish("ledger", b"entry", QoS::ExactlyOnce, Some(1)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(1)));
    publisher.send(&Packet::PubRel(1)).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(1)));

    let publish = subscriber.recv_publish().await;
    let packet_id = publish.packet_id.unwrap();
    subscriber.send(&Packet::PubRec(packet_id)).await;
    assert_eq!(subscriber.recv().await, Some(Packet::PubRel(packet_id)));
    drop(subscriber);

    let mut resumed = TestClient::connect(addr).await;
    let connack = resumed.mqtt_connect("resume-qos2", false).await;
    assert!(connack.session_present);

    // The handshake picks up at PUBREL, the message is not sent again
    assert_eq!(resumed.recv().await, Some(Packet::PubRel(packet_id)));
    resumed.send(&Packet::PubComp(packet_id)).await;
    assert_eq!(resumed.recv_within(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let (broker, addr) = start_default_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("shutdown", true).await;

    broker.shutdown();
    client.expect_closed().await;
}
