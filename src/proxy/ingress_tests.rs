use std::collections::HashMap;

use peer_core::drain;
use peer_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::*;
use crate::ProxyInputs;
use crate::metrics::Metrics;
use crate::plugin::PluginSet;
use crate::pool::{ConnectionPool, KeepaliveConfig};
use crate::store::{DocumentStore, MemoryStore};
use crate::{Config, geo};

const IMEI: &str = "353627071234564";
const FCM: &str = "skdfjhsdkjfhsdkjfhsdkjf";

#[test]
fn identity_without_app_version() {
	let identity = parse_identity(format!("{IMEI},{FCM}").as_bytes()).unwrap();
	assert_eq!(identity.imei, IMEI);
	assert_eq!(identity.fcm_id, FCM);
	assert_eq!(identity.app_version, "0");
}

#[test]
fn identity_with_app_version() {
	let identity = parse_identity(format!("{IMEI},{FCM},0001").as_bytes()).unwrap();
	assert_eq!(identity.app_version, "0001");
}

#[test]
fn identity_requires_fcm_id() {
	assert!(matches!(
		parse_identity(IMEI.as_bytes()),
		Err(IngressError::ProtocolAnomaly(_))
	));
}

#[test]
fn identity_fields_must_be_alphanumeric() {
	assert!(matches!(
		parse_identity(b"bad-imei!,fcmid"),
		Err(IngressError::ProtocolAnomaly(_))
	));
	assert!(matches!(
		parse_identity(format!("{IMEI},fcm id with spaces").as_bytes()),
		Err(IngressError::ProtocolAnomaly(_))
	));
}

#[test]
fn identity_must_be_utf8() {
	assert!(matches!(
		parse_identity(&[0xff, 0xfe, b',', b'x']),
		Err(IngressError::ProtocolAnomaly(_))
	));
}

fn test_inputs() -> Arc<ProxyInputs> {
	peer_core::telemetry::testing::setup_test_logging();
	let metrics = Arc::new(Metrics::unregistered());
	let cfg = Arc::new(Config {
		peer_server_port: 0,
		frontend_port: 0,
		country_to_port: HashMap::new(),
		max_threads: 4,
		whitelist: None,
		geoip: geo::Config::default(),
		keepalive: KeepaliveConfig {
			interval: Duration::from_secs(3600),
			used_purge_interval: Duration::from_secs(3600),
			..KeepaliveConfig::default()
		},
	});
	let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::default());
	Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		pool: Arc::new(ConnectionPool::new(cfg.keepalive.clone(), metrics.clone())),
		store,
		geo: Arc::new(geo::Disabled),
		plugins: PluginSet::default(),
		metrics,
	})
}

async fn await_enrollment(pi: &Arc<ProxyInputs>, expected: usize) {
	for _ in 0..100 {
		if pi.pool.len() == expected {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("pool never reached {expected} idle connections");
}

#[tokio::test]
async fn dialing_agent_is_enrolled_and_persisted() {
	let pi = test_inputs();
	let ingress = AgentIngress::bind(pi.clone()).unwrap();
	let addr = ingress.local_addr();
	let (_drain_tx, drain_rx) = drain::new();
	tokio::spawn(ingress.run(drain_rx));

	let mut agent = TcpStream::connect(addr).await.unwrap();
	agent
		.write_all(format!("{IMEI},{FCM},0001").as_bytes())
		.await
		.unwrap();

	await_enrollment(&pi, 1).await;
	let counts = pi.pool.count_by_country();
	assert_eq!(counts[&geo::NOT_AVAILABLE], 1);

	let devices = pi.store.devices().unwrap();
	assert_eq!(devices.len(), 1);
	assert_eq!(devices[0].imei, IMEI);
	assert_eq!(devices[0].fcm_id, FCM);
	assert_eq!(devices[0].app_version, "0001");
	assert_eq!(devices[0].country_code, geo::NOT_AVAILABLE);
}

#[tokio::test]
async fn malformed_identity_frame_closes_the_socket() {
	let pi = test_inputs();
	let ingress = AgentIngress::bind(pi.clone()).unwrap();
	let addr = ingress.local_addr();
	let (_drain_tx, drain_rx) = drain::new();
	tokio::spawn(ingress.run(drain_rx));

	let mut agent = TcpStream::connect(addr).await.unwrap();
	agent.write_all(b"not*valid*imei,fcm").await.unwrap();

	// The server drops the socket; we observe EOF.
	let mut buf = [0u8; 1];
	let n = tokio::time::timeout(Duration::from_secs(2), agent.read(&mut buf))
		.await
		.expect("server should close the socket")
		.unwrap();
	assert_eq!(n, 0);
	assert_eq!(pi.pool.len(), 0);
	assert!(pi.store.devices().unwrap().is_empty());
}

#[tokio::test]
async fn two_agents_enroll_independently() {
	let pi = test_inputs();
	let ingress = AgentIngress::bind(pi.clone()).unwrap();
	let addr = ingress.local_addr();
	let (_drain_tx, drain_rx) = drain::new();
	tokio::spawn(ingress.run(drain_rx));

	let mut first = TcpStream::connect(addr).await.unwrap();
	first
		.write_all(format!("{IMEI},{FCM}").as_bytes())
		.await
		.unwrap();
	let mut second = TcpStream::connect(addr).await.unwrap();
	second
		.write_all(format!("000070000700007,{FCM}").as_bytes())
		.await
		.unwrap();

	await_enrollment(&pi, 2).await;
	assert_eq!(pi.store.devices().unwrap().len(), 2);
}
