//! Admin and observability HTTP surface.
//!
//! Read-only views over the pool and store plus the device-wake actions,
//! served on the frontend port. Everything here is best-effort snapshotting;
//! the data plane never waits on this server.

use std::collections::{BTreeMap, HashMap};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use peer_core::drain::DrainWatcher;
use peer_core::prelude::*;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::ProxyInputs;
use crate::wake::DeviceWaker;

#[derive(Clone)]
struct AdminState {
	pi: Arc<ProxyInputs>,
	waker: Arc<DeviceWaker>,
	registry: Arc<Registry>,
}

pub struct Server {
	listener: TcpListener,
	state: AdminState,
}

impl Server {
	pub async fn bind(
		pi: Arc<ProxyInputs>,
		waker: Arc<DeviceWaker>,
		registry: Arc<Registry>,
	) -> anyhow::Result<Server> {
		let addr = SocketAddr::from(([0, 0, 0, 0], pi.cfg.frontend_port));
		let listener = TcpListener::bind(addr).await?;
		info!(addr = %listener.local_addr()?, "admin server listening");
		Ok(Server {
			listener,
			state: AdminState {
				pi,
				waker,
				registry,
			},
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.listener.local_addr().expect("listener has an address")
	}

	pub async fn run(self, drain: DrainWatcher) {
		let router = router(self.state);
		let serve = axum::serve(self.listener, router).with_graceful_shutdown(async move {
			let _blocker = drain.wait_for_drain().await;
		});
		if let Err(e) = serve.await {
			warn!("admin server exited: {e}");
		}
	}
}

fn router(state: AdminState) -> Router {
	Router::new()
		.route("/map", get(map))
		.route("/wakeup", post(wakeup))
		.route("/airplane", post(airplane))
		.route("/connected_imeis", get(connected_imeis))
		.route("/active_connections", get(active_connections))
		.route("/available_asns_per_country", get(available_asns_per_country))
		.route("/country_to_port", get(country_to_port))
		.route("/metrics", get(metrics))
		.with_state(state)
}

#[derive(Debug, Default, Serialize)]
struct CountryCounts {
	all: usize,
	awaiting_peers: usize,
	used_ports: usize,
}

/// Device counts per country across the three registers: everything the
/// store knows, idle in the pool, and currently spliced.
async fn map(State(state): State<AdminState>) -> impl IntoResponse {
	let all = state
		.pi
		.store
		.count_devices_by_country()
		.unwrap_or_default();
	let awaiting = state.pi.pool.count_by_country();
	let used = state.pi.pool.used_by_country();

	let mut merged: BTreeMap<Strng, CountryCounts> = BTreeMap::new();
	for (country, n) in all {
		merged.entry(country).or_default().all = n;
	}
	for (country, n) in awaiting {
		merged.entry(country).or_default().awaiting_peers = n;
	}
	for (country, n) in used {
		merged.entry(country).or_default().used_ports = n;
	}
	axum::Json(merged)
}

#[derive(Debug, Deserialize)]
struct WakeupParams {
	cc: Option<String>,
	imei: Option<String>,
}

async fn wakeup(
	State(state): State<AdminState>,
	Query(params): Query<WakeupParams>,
) -> impl IntoResponse {
	let woken = match (&params.cc, &params.imei) {
		(Some(cc), _) => state.waker.wake_by_country(cc).await,
		(None, Some(imei)) => state.waker.wake_by_imei(imei).await,
		(None, None) => {
			return (
				StatusCode::BAD_REQUEST,
				"imei or cc should be sent as request args",
			);
		},
	};
	if woken {
		(StatusCode::OK, "Push sent")
	} else {
		(StatusCode::OK, "Push failed")
	}
}

#[derive(Debug, Deserialize)]
struct AirplaneParams {
	ip: Option<IpAddr>,
}

async fn airplane(
	State(state): State<AdminState>,
	Query(params): Query<AirplaneParams>,
) -> impl IntoResponse {
	let Some(ip) = params.ip else {
		return (
			StatusCode::BAD_REQUEST,
			"ip is expected as request argument",
		);
	};
	if state.waker.cycle_airplane(ip).await {
		(StatusCode::OK, "Success")
	} else {
		(StatusCode::OK, "Failed")
	}
}

async fn connected_imeis(State(state): State<AdminState>) -> impl IntoResponse {
	axum::Json(state.pi.pool.device_ids(false))
}

#[derive(Debug, Serialize)]
struct ActiveConnection {
	device_id: Strng,
	country_code: Strng,
}

async fn active_connections(State(state): State<AdminState>) -> impl IntoResponse {
	let active: Vec<ActiveConnection> = state
		.pi
		.pool
		.active_connections()
		.into_iter()
		.map(|(device_id, country_code)| ActiveConnection {
			device_id,
			country_code,
		})
		.collect();
	axum::Json(active)
}

async fn available_asns_per_country(State(state): State<AdminState>) -> impl IntoResponse {
	axum::Json(state.pi.store.available_asns().unwrap_or_default())
}

async fn country_to_port(State(state): State<AdminState>) -> impl IntoResponse {
	let mapping: HashMap<Strng, u16> = state.pi.cfg.country_to_port.clone();
	axum::Json(mapping)
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
	let mut body = String::new();
	match prometheus_client::encoding::text::encode(&mut body, &state.registry) {
		Ok(()) => (StatusCode::OK, body),
		Err(e) => (
			StatusCode::INTERNAL_SERVER_ERROR,
			format!("failed to encode metrics: {e}"),
		),
	}
}
