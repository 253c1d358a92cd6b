//! Dispatch and registration tests against a fake broker socket.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use meshrpc_catalog::mock::MockRegistry;
use meshrpc_common::protocol::{ERR_NO_WORKERS, HEARTBEAT_PROBE, HEARTBEAT_REPLY, WORKER_READY};
use meshrpc_common::transport::{PeerSocket, RouterSocket};
use meshrpc_server::service::{self, ServiceConfig};
use meshrpc_server::worker::FnHandler;
use meshrpc_server::{Server, ServerConfig, Worker};

fn local_config() -> ServerConfig {
    ServerConfig {
        frontend_endpoint: "127.0.0.1:0".to_string(),
        backend_endpoint: "127.0.0.1:0".to_string(),
    }
}

/// Dials the server frontend the way a broker does and returns the
/// socket together with the endpoint key used to address it.
async fn fake_broker(addr: std::net::SocketAddr) -> (RouterSocket, Bytes) {
    let mut broker = RouterSocket::new("fake-broker");
    let endpoint = addr.to_string();
    broker.connect(&endpoint).await.unwrap();
    (broker, Bytes::copy_from_slice(endpoint.as_bytes()))
}

#[tokio::test]
async fn test_heartbeat_answered_without_workers() {
    let server = Server::start("Quiet", local_config()).await.unwrap();
    let (mut broker, endpoint) = fake_broker(server.frontend_addr()).await;

    broker
        .send(vec![endpoint.clone(), Bytes::from_static(HEARTBEAT_PROBE)])
        .await
        .unwrap();

    let reply = broker.recv().await.unwrap();
    assert_eq!(reply[0], endpoint);
    assert_eq!(reply[1].as_ref(), HEARTBEAT_REPLY);

    server.stop().await;
}

#[tokio::test]
async fn test_request_without_workers_gets_error_reply() {
    let server = Server::start("Quiet", local_config()).await.unwrap();
    let (mut broker, endpoint) = fake_broker(server.frontend_addr()).await;

    broker
        .send(vec![
            endpoint.clone(),
            Bytes::from_static(b"caller-1"),
            Bytes::new(),
            Bytes::from_static(b"work"),
        ])
        .await
        .unwrap();

    let reply = broker.recv().await.unwrap();
    assert_eq!(reply[0], endpoint);
    assert_eq!(reply[1].as_ref(), b"caller-1");
    assert!(reply[2].is_empty());
    assert_eq!(reply[3].as_ref(), ERR_NO_WORKERS.as_bytes());

    server.stop().await;
}

#[tokio::test]
async fn test_worker_dispatch_round_trip() {
    let server = Server::start("Echo", local_config()).await.unwrap();

    let handler = Arc::new(FnHandler(|payload: Bytes| {
        Bytes::from(payload.to_ascii_uppercase())
    }));
    let worker = Worker::spawn(
        &server.backend_addr().to_string(),
        "worker-echo-0",
        handler,
        server.subscribe_shutdown(),
    )
    .await
    .unwrap();

    let (mut broker, endpoint) = fake_broker(server.frontend_addr()).await;

    // The readiness announcement races this first request; retry until
    // the worker is in the queue.
    let reply = loop {
        broker
            .send(vec![
                endpoint.clone(),
                Bytes::from_static(b"caller-1"),
                Bytes::new(),
                Bytes::from_static(b"hello"),
            ])
            .await
            .unwrap();

        let reply = broker.recv().await.unwrap();
        if reply.last().unwrap().as_ref() != ERR_NO_WORKERS.as_bytes() {
            break reply;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(reply[0], endpoint);
    assert_eq!(reply[1].as_ref(), b"caller-1");
    assert!(reply[2].is_empty());
    assert_eq!(reply[3].as_ref(), b"HELLO");

    // Responding re-queues the worker without a fresh announcement.
    broker
        .send(vec![
            endpoint.clone(),
            Bytes::from_static(b"caller-2"),
            Bytes::new(),
            Bytes::from_static(b"again"),
        ])
        .await
        .unwrap();

    let reply = broker.recv().await.unwrap();
    assert_eq!(reply[1].as_ref(), b"caller-2");
    assert_eq!(reply[3].as_ref(), b"AGAIN");

    server.stop().await;
    let _ = worker.await;
}

#[tokio::test]
async fn test_malformed_worker_delimiter_not_forwarded_or_requeued() {
    let server = Server::start("Strict", local_config()).await.unwrap();

    // Readiness announced with a non-empty delimiter frame breaks the
    // worker protocol.
    let mut worker = PeerSocket::connect(&server.backend_addr().to_string(), "worker-bad")
        .await
        .unwrap();
    worker
        .send(vec![
            Bytes::from_static(b"oops"),
            Bytes::from_static(WORKER_READY),
        ])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The worker must not be in the queue, so a request bounces.
    let (mut broker, endpoint) = fake_broker(server.frontend_addr()).await;
    broker
        .send(vec![
            endpoint.clone(),
            Bytes::from_static(b"caller-1"),
            Bytes::new(),
            Bytes::from_static(b"work"),
        ])
        .await
        .unwrap();

    let reply = broker.recv().await.unwrap();
    assert_eq!(reply.last().unwrap().as_ref(), ERR_NO_WORKERS.as_bytes());

    // And the rejected message produced no dispatch to the worker.
    let dispatched = tokio::time::timeout(Duration::from_millis(100), worker.recv()).await;
    assert!(dispatched.is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_service_registers_and_deregisters() {
    let catalog = Arc::new(MockRegistry::new());
    let handler = Arc::new(FnHandler(|p: Bytes| p));

    let handle = service::start(
        "Orders",
        handler,
        catalog.clone(),
        ServiceConfig {
            server: local_config(),
            advertised_address: "127.0.0.1".to_string(),
            workers: 2,
        },
    )
    .await
    .unwrap();

    let registered = catalog.registered();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].service, "Orders");
    assert_eq!(registered[0].address, "127.0.0.1");
    assert_eq!(registered[0].port, handle.frontend_addr().port());

    let id = handle.id().to_string();
    handle.stop().await;
    assert_eq!(catalog.deregistered(), vec![id]);
}
