//! Full-mesh tests: client, broker, discovery, server and workers wired
//! together over loopback, with a scripted catalog.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use meshrpc_broker::{BrokerConfig, BrokerRegistry, DiscoveryConfig};
use meshrpc_catalog::mock::{MockNodeSource, MockRegistry};
use meshrpc_client::Client;
use meshrpc_common::MeshError;
use meshrpc_server::service::{self, ServiceConfig, ServiceHandle};
use meshrpc_server::worker::FnHandler;
use meshrpc_server::ServerConfig;

/// `RUST_LOG=debug cargo test` shows the mesh chatter.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        local_endpoint: "127.0.0.1:0".to_string(),
        discovery: DiscoveryConfig {
            probe_interval: Duration::from_millis(50),
            failure_threshold: 3,
            retry_delay: Duration::from_millis(10),
        },
    }
}

async fn start_node(
    name: &str,
    handler: impl Fn(Bytes) -> Bytes + Send + Sync + 'static,
) -> ServiceHandle {
    service::start(
        name,
        Arc::new(FnHandler(handler)),
        Arc::new(MockRegistry::new()),
        ServiceConfig {
            server: ServerConfig {
                frontend_endpoint: "127.0.0.1:0".to_string(),
                backend_endpoint: "127.0.0.1:0".to_string(),
            },
            advertised_address: "127.0.0.1".to_string(),
            workers: 2,
        },
    )
    .await
    .unwrap()
}

/// Calls until the mesh has warmed up. Discovery, connection setup and
/// worker readiness all race the first request, so callers retry the
/// retryable errors.
async fn call_retry(client: &mut Client, payload: Bytes) -> Bytes {
    for _ in 0..200 {
        match client.call(payload.clone()).await {
            Ok(response) => return response,
            Err(MeshError::NoNodesAvailable | MeshError::NoWorkersAvailable) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("call failed: {}", e),
        }
    }
    panic!("service never became available");
}

#[tokio::test]
async fn test_end_to_end_echo() {
    init_tracing();
    let node = start_node("Echo", |payload: Bytes| {
        Bytes::from(payload.to_ascii_uppercase())
    })
    .await;

    let source = Arc::new(MockNodeSource::with_listing([node
        .frontend_addr()
        .to_string()]));
    let registry = BrokerRegistry::new(source, broker_config());
    let mut client = Client::connect(&registry, "Echo").await.unwrap();

    let response = call_retry(&mut client, Bytes::from_static(b"hello mesh")).await;
    assert_eq!(response.as_ref(), b"HELLO MESH");

    registry.stop_all().await;
    node.stop().await;
}

#[tokio::test]
async fn test_payload_survives_byte_for_byte() {
    init_tracing();
    let node = start_node("Mirror", |payload: Bytes| payload).await;

    let source = Arc::new(MockNodeSource::with_listing([node
        .frontend_addr()
        .to_string()]));
    let registry = BrokerRegistry::new(source, broker_config());
    let mut client = Client::connect(&registry, "Mirror").await.unwrap();

    // Opaque binary payload with embedded zero and high bytes.
    let payload = Bytes::from(vec![0u8, 1, 2, 0xff, 0x80, 0, 42]);
    let response = call_retry(&mut client, payload.clone()).await;
    assert_eq!(response, payload);

    registry.stop_all().await;
    node.stop().await;
}

#[tokio::test]
async fn test_round_robin_across_two_nodes() {
    init_tracing();
    let node_a = start_node("Tagged", |_| Bytes::from_static(b"node-a")).await;
    let node_b = start_node("Tagged", |_| Bytes::from_static(b"node-b")).await;

    let source = Arc::new(MockNodeSource::with_listing([
        node_a.frontend_addr().to_string(),
        node_b.frontend_addr().to_string(),
    ]));
    let registry = BrokerRegistry::new(source, broker_config());
    let mut client = Client::connect(&registry, "Tagged").await.unwrap();

    // Warm up until both nodes have answered at least once.
    let mut seen_a = false;
    let mut seen_b = false;
    for _ in 0..200 {
        match call_retry(&mut client, Bytes::from_static(b"who")).await.as_ref() {
            b"node-a" => seen_a = true,
            b"node-b" => seen_b = true,
            other => panic!("unexpected response: {:?}", other),
        }
        if seen_a && seen_b {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen_a && seen_b);

    // With both nodes in the rotation, consecutive calls alternate.
    let mut tags = Vec::new();
    for _ in 0..4 {
        tags.push(call_retry(&mut client, Bytes::from_static(b"who")).await);
    }
    assert_ne!(tags[0], tags[1]);
    assert_eq!(tags[0], tags[2]);
    assert_eq!(tags[1], tags[3]);

    registry.stop_all().await;
    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_no_nodes_surfaces_as_error() {
    init_tracing();
    let source = Arc::new(MockNodeSource::new());
    let registry = BrokerRegistry::new(source, broker_config());
    let mut client = Client::connect(&registry, "Ghost").await.unwrap();

    let err = client.call(Bytes::from_static(b"anyone?")).await.unwrap_err();
    assert!(matches!(err, MeshError::NoNodesAvailable));

    registry.stop_all().await;
}

#[tokio::test]
async fn test_deregistered_node_stops_receiving_requests() {
    init_tracing();
    let node = start_node("Fading", |payload: Bytes| payload).await;

    let source = MockNodeSource::new();
    source.push_listing([node.frontend_addr().to_string()]);
    source.push_listing(Vec::<String>::new());

    let registry = BrokerRegistry::new(Arc::new(source), broker_config());
    let mut client = Client::connect(&registry, "Fading").await.unwrap();

    // The empty listing lands shortly after the first; once applied,
    // every call fails with an empty rotation.
    let mut evicted = false;
    for _ in 0..200 {
        match client.call(Bytes::from_static(b"ping")).await {
            Err(MeshError::NoNodesAvailable) => {
                evicted = true;
                break;
            }
            Ok(_) | Err(MeshError::NoWorkersAvailable) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("call failed: {}", e),
        }
    }
    assert!(evicted);

    registry.stop_all().await;
    node.stop().await;
}
