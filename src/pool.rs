//! Country/ASN-indexed inventory of idle agent sockets.
//!
//! Agents enroll through the ingress and sit here until the splice engine
//! withdraws one. Two recurring sweeps keep the inventory honest: a full
//! keep-alive probe over every idle socket, and a cheaper purge of the
//! in-use register based on kernel TCP state.
//!
//! Locking: one mutex guards the whole index and is held only across
//! O(bucket) work. The keep-alive sweep detaches a bucket under the lock,
//! probes outside it, and re-attaches survivors ahead of anything inserted
//! meanwhile, so inserts and pops never wait on a probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use peer_core::drain::DrainWatcher;
use peer_core::prelude::*;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::metrics::Metrics;
use crate::plugin::monitor::ALERT_PROTOCOL;
use crate::transport;

pub const KEEPALIVE_PROBE: &[u8] = b"KEAL";

/// Agents answer a probe with one of these instead of the echo to report
/// that they are no longer a usable exit. Only probe-length bytes are read,
/// so classification matches on the sentinel's leading bytes.
pub const WIFI_WARN_SENTINEL: &[u8] = b"waaxbkceuvmmonqxtxbequkjvarqkehqjzzetfvyagr\
kwafqujqiiqxuautddwfsobmegzaygdcawwdvjoodpr\
foexyonvygplshecndoysfajaapenheqbssehlpnvf";

pub const DEBUGGER_WARN_SENTINEL: &[u8] = b"SPZ4SOCCHFIH23VFF00KCQNIZ4QKUKG5VG283AMJK\
7AFC2NUPDTYC7MBRX4VHHBDQT9TTRXQYD0SZ8TXGU7OUT\
GL3TQUWOQ2ONKHYA12KWWZDDG9ZLYTS0FR1NT5OKLM";

const MAX_PARALLEL_PROBES: usize = 25;

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
	pub interval: Duration,
	pub probe_timeout: Duration,
	pub attempts: u32,
	pub retry_delay: Duration,
	pub used_purge_interval: Duration,
}

impl Default for KeepaliveConfig {
	fn default() -> Self {
		KeepaliveConfig {
			interval: Duration::from_secs(15 * 60),
			probe_timeout: Duration::from_secs(2),
			attempts: 3,
			retry_delay: Duration::from_secs(1),
			used_purge_interval: Duration::from_secs(120),
		}
	}
}

/// An idle agent socket plus the identity it enrolled with.
#[derive(Debug)]
pub struct AgentConnection {
	pub sock: TcpStream,
	pub country_code: Strng,
	pub asn: Strng,
	pub device_id: Strng,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LeaseId(u64);

/// A withdrawn agent. The socket now belongs to the caller; the pool keeps
/// only the in-use bookkeeping entry, dropped along with the guard.
#[derive(Debug)]
pub struct PooledAgent {
	pub conn: AgentConnection,
	pub guard: LeaseGuard,
}

/// Releases the in-use entry when dropped, so a lease cannot leak even if a
/// splice task dies abnormally.
#[derive(Debug)]
pub struct LeaseGuard {
	lease: LeaseId,
	state: std::sync::Weak<Mutex<PoolState>>,
}

impl Drop for LeaseGuard {
	fn drop(&mut self) {
		if let Some(state) = self.state.upgrade() {
			let lease = self.lease;
			state
				.lock()
				.expect("pool lock poisoned")
				.used
				.retain(|entry| entry.lease != lease);
		}
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("no available connection for {country}{}", .asn.as_ref().map(|a| format!("/{a}")).unwrap_or_default())]
pub struct NoAvailableConnection {
	pub country: Strng,
	pub asn: Option<Strng>,
}

#[derive(Debug)]
struct UsedEntry {
	lease: LeaseId,
	device_id: Strng,
	country_code: Strng,
	probe: Option<std::net::TcpStream>,
}

#[derive(Debug, Default)]
struct PoolState {
	available: HashMap<Strng, HashMap<Strng, Vec<AgentConnection>>>,
	used: Vec<UsedEntry>,
}

pub struct ConnectionPool {
	state: Arc<Mutex<PoolState>>,
	cfg: KeepaliveConfig,
	metrics: Arc<Metrics>,
	next_lease: AtomicU64,
}

impl ConnectionPool {
	pub fn new(cfg: KeepaliveConfig, metrics: Arc<Metrics>) -> Self {
		ConnectionPool {
			state: Arc::new(Mutex::new(PoolState::default())),
			cfg,
			metrics,
			next_lease: AtomicU64::new(0),
		}
	}

	pub fn insert(&self, conn: AgentConnection) {
		info!(country = %conn.country_code, asn = %conn.asn, "new peer");
		let mut state = self.lock();
		state
			.available
			.entry(conn.country_code.clone())
			.or_default()
			.entry(conn.asn.clone())
			.or_default()
			.push(conn);
	}

	/// Withdraw the freshest connection under any ASN of the country. Buckets
	/// are tried in arbitrary order; the first non-empty one wins.
	pub fn pop_by_country(&self, country_code: &str) -> Result<PooledAgent, NoAvailableConnection> {
		let mut state = self.lock();
		let conn = state
			.available
			.get_mut(country_code)
			.and_then(|buckets| buckets.values_mut().find_map(Vec::pop));
		match conn {
			Some(conn) => {
				debug!(country = country_code, device = %conn.device_id, "popped connection");
				Ok(self.lease(&mut state, conn))
			},
			None => Err(NoAvailableConnection {
				country: strng::new(country_code),
				asn: None,
			}),
		}
	}

	pub fn pop_by_country_and_asn(
		&self,
		country_code: &str,
		asn: &str,
	) -> Result<PooledAgent, NoAvailableConnection> {
		let mut state = self.lock();
		let conn = state
			.available
			.get_mut(country_code)
			.and_then(|buckets| buckets.get_mut(asn))
			.and_then(Vec::pop);
		match conn {
			Some(conn) => Ok(self.lease(&mut state, conn)),
			None => Err(NoAvailableConnection {
				country: strng::new(country_code),
				asn: Some(strng::new(asn)),
			}),
		}
	}

	fn lease(&self, state: &mut PoolState, conn: AgentConnection) -> PooledAgent {
		let lease = LeaseId(self.next_lease.fetch_add(1, Ordering::Relaxed));
		state.used.push(UsedEntry {
			lease,
			device_id: conn.device_id.clone(),
			country_code: conn.country_code.clone(),
			probe: transport::clone_probe(&conn.sock),
		});
		PooledAgent {
			conn,
			guard: LeaseGuard {
				lease,
				state: Arc::downgrade(&self.state),
			},
		}
	}

	/// Snapshot of idle connection counts per country.
	pub fn count_by_country(&self) -> HashMap<Strng, usize> {
		let state = self.lock();
		state
			.available
			.iter()
			.map(|(country, buckets)| {
				(
					country.clone(),
					buckets.values().map(Vec::len).sum::<usize>(),
				)
			})
			.collect()
	}

	/// Count of in-use connections per country.
	pub fn used_by_country(&self) -> HashMap<Strng, usize> {
		let state = self.lock();
		let mut counts: HashMap<Strng, usize> = HashMap::new();
		for entry in &state.used {
			*counts.entry(entry.country_code.clone()).or_default() += 1;
		}
		counts
	}

	/// `(device_id, country_code)` for every in-use connection.
	pub fn active_connections(&self) -> Vec<(Strng, Strng)> {
		let state = self.lock();
		state
			.used
			.iter()
			.map(|e| (e.device_id.clone(), e.country_code.clone()))
			.collect()
	}

	/// Device ids across idle and in-use connections.
	pub fn device_ids(&self, distinct: bool) -> Vec<Strng> {
		let state = self.lock();
		let mut ids: Vec<Strng> = state
			.available
			.values()
			.flat_map(|buckets| buckets.values())
			.flatten()
			.map(|c| c.device_id.clone())
			.chain(state.used.iter().map(|e| e.device_id.clone()))
			.collect();
		if distinct {
			ids.sort();
			ids.dedup();
		}
		ids
	}

	/// Total idle connections.
	pub fn len(&self) -> usize {
		let state = self.lock();
		state
			.available
			.values()
			.flat_map(|buckets| buckets.values())
			.map(Vec::len)
			.sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Release every socket, idle and in-use. In-use sockets are owned by
	/// their splice tasks; shutting the duplicated fd down unblocks them.
	pub fn close_all(&self) {
		let mut state = self.lock();
		state.available.clear();
		for entry in state.used.drain(..) {
			if let Some(probe) = entry.probe {
				let _ = probe.shutdown(std::net::Shutdown::Both);
			}
		}
	}

	/// Run both sweeps until a drain is triggered.
	pub async fn run(self: Arc<Self>, drain: DrainWatcher) {
		let mut keepalive = tokio::time::interval(self.cfg.interval);
		keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let mut purge = tokio::time::interval(self.cfg.used_purge_interval);
		purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// The first tick of an interval fires immediately.
		keepalive.tick().await;
		purge.tick().await;

		let shutdown = drain.wait_for_drain();
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				_ = keepalive.tick() => self.keepalive_sweep().await,
				_ = purge.tick() => self.purge_used(),
				_ = &mut shutdown => {
					debug!("pool sweeps stopped");
					return;
				},
			}
		}
	}

	/// Probe every idle connection and rewrite each bucket to the survivors.
	pub async fn keepalive_sweep(&self) {
		info!("starting keep alive cycle");
		let buckets: Vec<(Strng, Strng)> = {
			let state = self.lock();
			state
				.available
				.iter()
				.flat_map(|(country, buckets)| {
					buckets.keys().map(|asn| (country.clone(), asn.clone()))
				})
				.collect()
		};
		for (country, asn) in buckets {
			let detached = {
				let mut state = self.lock();
				state
					.available
					.get_mut(&country)
					.and_then(|buckets| buckets.get_mut(&asn))
					.map(std::mem::take)
					.unwrap_or_default()
			};
			if detached.is_empty() {
				continue;
			}
			let total = detached.len();

			let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_PROBES));
			let mut probes = JoinSet::new();
			for (idx, mut conn) in detached.into_iter().enumerate() {
				let semaphore = semaphore.clone();
				let cfg = self.cfg.clone();
				probes.spawn(async move {
					let _permit = semaphore.acquire().await.expect("semaphore never closed");
					let alive = probe_connection(&cfg, &mut conn).await && transport::established(&conn.sock);
					(idx, conn, alive)
				});
			}
			let mut survivors = Vec::new();
			while let Some(res) = probes.join_next().await {
				match res {
					Ok((idx, conn, true)) => survivors.push((idx, conn)),
					Ok((_, conn, false)) => {
						self.metrics.keepalive_evictions.inc();
						drop(conn);
					},
					Err(e) => warn!("keep alive probe task failed: {e}"),
				}
			}
			// Preserve insertion order among survivors so the bucket stays LIFO.
			survivors.sort_by_key(|(idx, _)| *idx);
			let removed = total - survivors.len();

			{
				let mut state = self.lock();
				let bucket = state
					.available
					.entry(country.clone())
					.or_default()
					.entry(asn.clone())
					.or_default();
				// Anything in the bucket now was inserted during the probe and is
				// fresher than every survivor.
				let mut inserted_meanwhile = std::mem::take(bucket);
				bucket.extend(survivors.into_iter().map(|(_, conn)| conn));
				bucket.append(&mut inserted_meanwhile);
			}
			info!(
				country = %country,
				asn = %asn,
				removed,
				remaining = total - removed,
				"keep alive check finished"
			);
		}
	}

	/// Drop in-use entries whose socket is no longer `ESTABLISHED`.
	pub fn purge_used(&self) {
		let mut state = self.lock();
		state.used.retain(|entry| match &entry.probe {
			Some(probe) => transport::established(probe),
			// Without a probe fd we cannot observe the socket; the splice task
			// releases the lease on teardown.
			None => true,
		});
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
		self.state.lock().expect("pool lock poisoned")
	}
}

/// One keep-alive exchange, retried a fixed number of times. Tamper
/// sentinels are definitive; anything else gets the full retry window.
async fn probe_connection(cfg: &KeepaliveConfig, conn: &mut AgentConnection) -> bool {
	for attempt in 0..cfg.attempts {
		if attempt > 0 {
			tokio::time::sleep(cfg.retry_delay).await;
		}
		match probe_once(cfg, &mut conn.sock).await {
			ProbeOutcome::Echoed => return true,
			ProbeOutcome::WifiDetected => {
				error!(device = %conn.device_id, "wifi connection has been detected");
				return false;
			},
			ProbeOutcome::DebuggerDetected => {
				error!(device = %conn.device_id, "debugger connection has been detected");
				return false;
			},
			ProbeOutcome::Dead => {},
		}
	}
	false
}

enum ProbeOutcome {
	Echoed,
	WifiDetected,
	DebuggerDetected,
	Dead,
}

async fn probe_once(cfg: &KeepaliveConfig, sock: &mut TcpStream) -> ProbeOutcome {
	if sock.write_all(KEEPALIVE_PROBE).await.is_err() {
		return ProbeOutcome::Dead;
	}
	let mut buf = [0u8; KEEPALIVE_PROBE.len()];
	let n = match tokio::time::timeout(cfg.probe_timeout, sock.read(&mut buf)).await {
		Ok(Ok(n)) => n,
		_ => return ProbeOutcome::Dead,
	};
	let response = &buf[..n];
	if response == KEEPALIVE_PROBE {
		ProbeOutcome::Echoed
	} else if n > 0 && WIFI_WARN_SENTINEL.starts_with(response) {
		ProbeOutcome::WifiDetected
	} else if n > 0 && DEBUGGER_WARN_SENTINEL.starts_with(response) {
		ProbeOutcome::DebuggerDetected
	} else if n == 0 {
		ProbeOutcome::Dead
	} else {
		error!(
			alert = ALERT_PROTOCOL,
			response = %hex::encode(response),
			"unexpected keep-alive response"
		);
		ProbeOutcome::Dead
	}
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
