//! Wires the components together and owns the shutdown sequence.

use peer_core::drain::{self, DrainTrigger};
use peer_core::prelude::*;
use prometheus_client::registry::Registry;

use crate::plugin::PluginSet;
use crate::plugin::dataplan::DataplanTracker;
use crate::plugin::monitor::ProtocolMonitor;
use crate::pool::ConnectionPool;
use crate::proxy::ingress::AgentIngress;
use crate::proxy::splice::SpliceEngine;
use crate::store::{DocumentStore, MemoryStore};
use crate::wake::{DeviceWaker, NullChannel};
use crate::whitelist::WhitelistResolver;
use crate::{Config, ProxyInputs, admin, geo, metrics, tasks};

pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let mut registry = Registry::default();
	let metrics = Arc::new(metrics::Metrics::new(metrics::sub_registry(&mut registry)));

	let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::default());
	let geo = geo::from_config(&cfg.geoip);
	let pool = Arc::new(ConnectionPool::new(cfg.keepalive.clone(), metrics.clone()));

	let whitelist = match &cfg.whitelist {
		Some(wl_cfg) => Some(WhitelistResolver::new(wl_cfg)?),
		None => None,
	};
	let plugins = PluginSet::new(vec![
		Arc::new(ProtocolMonitor::new(store.clone(), whitelist.clone())),
		Arc::new(DataplanTracker::new(store.clone())),
	]);

	let (drain_tx, drain_rx) = drain::new();
	let pi = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		pool: pool.clone(),
		store: store.clone(),
		geo,
		plugins,
		metrics,
	});

	tokio::spawn(pool.clone().run(drain_rx.clone()));
	if let Some(whitelist) = whitelist {
		tokio::spawn(whitelist.run(drain_rx.clone()));
	}
	tasks::spawn(store.clone(), drain_rx.clone());

	let ingress = AgentIngress::bind(pi.clone())?;
	tokio::spawn(ingress.run(drain_rx.clone()));

	let engine = SpliceEngine::bind(pi.clone())?;
	tokio::spawn(engine.run(drain_rx.clone()));

	let waker = Arc::new(DeviceWaker::new(store, Arc::new(NullChannel)));
	let admin_server = admin::Server::bind(pi, waker, Arc::new(registry)).await?;
	tokio::spawn(admin_server.run(drain_rx));

	Ok(Bound { drain_tx, pool })
}

pub struct Bound {
	drain_tx: DrainTrigger,
	pool: Arc<ConnectionPool>,
}

impl Bound {
	/// Block until a shutdown signal arrives, then drain every component and
	/// release the pooled sockets.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		wait_for_signal().await;
		self.drain_tx.start_drain_and_wait().await;
		self.pool.close_all();
		info!("shutdown complete");
		Ok(())
	}
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
	let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
	tokio::select! {
		_ = interrupt.recv() => info!("received SIGINT, starting shutdown"),
		_ = terminate.recv() => info!("received SIGTERM, starting shutdown"),
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received ctrl-c, starting shutdown");
}
