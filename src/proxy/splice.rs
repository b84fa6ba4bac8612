//! The splice engine: per-country client listeners, pairing, forwarding.
//!
//! Each country in the configuration gets one listener. An accepted client
//! is paired with the freshest idle agent for that country, registered with
//! every plugin, and forwarded chunk-by-chunk in both directions until EOF,
//! a transport error, or a plugin veto. One task drives each splice, so the
//! byte order within a direction is preserved and one splice's failure can
//! never reach another.

use std::collections::HashMap;
use std::io;

use peer_core::drain::DrainWatcher;
use peer_core::prelude::*;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::ProxyInputs;
use crate::plugin::{ConnectionInvalid, Side, SpliceId};
use crate::transport;

const SPLICE_READ_SIZE: usize = 1024;
const BACKLOG_PER_COUNTRY: i32 = 10;

/// Sent to the agent when its splice ends; the agent resets its upstream
/// and dials back in.
pub const CLOSING_SENTINEL: &[u8] = b"9TS0JUUL8HARDIP8JS9LFMH1UIRECWOQX109KF\
1GZFUV6N4RH68QM5SFDL1I6ORGDZ071OA85460HGY\
T8M2K134Y367XRAE5FDSU8YSUA09DQMO7KI61VIL6\
45DYCXE3";

#[derive(Error, Debug)]
enum SpliceError {
	#[error("client transport: {0}")]
	Client(#[source] io::Error),
	#[error("agent transport: {0}")]
	Agent(#[source] io::Error),
	#[error(transparent)]
	Vetoed(#[from] ConnectionInvalid),
}

impl SpliceError {
	fn is_broken_pipe(&self) -> bool {
		matches!(
			self,
			SpliceError::Client(e) | SpliceError::Agent(e)
				if e.kind() == io::ErrorKind::BrokenPipe
		)
	}
}

pub struct SpliceEngine {
	pi: Arc<ProxyInputs>,
	listeners: Vec<(Strng, TcpListener)>,
}

impl SpliceEngine {
	/// Bind one listener per configured country. Binding up front lets
	/// callers read back the chosen ports before the engine runs.
	pub fn bind(pi: Arc<ProxyInputs>) -> anyhow::Result<SpliceEngine> {
		let mut listeners = Vec::new();
		for (country, port) in &pi.cfg.country_to_port {
			let addr = SocketAddr::from(([0, 0, 0, 0], *port));
			let listener = transport::bind_listener(addr, BACKLOG_PER_COUNTRY)?;
			info!(
				port = listener.local_addr()?.port(),
				country = %country,
				"opened ingress port for reaching devices"
			);
			listeners.push((country.clone(), listener));
		}
		Ok(SpliceEngine { pi, listeners })
	}

	/// The bound address per country.
	pub fn addresses(&self) -> HashMap<Strng, SocketAddr> {
		self
			.listeners
			.iter()
			.filter_map(|(country, listener)| {
				listener
					.local_addr()
					.ok()
					.map(|addr| (country.clone(), addr))
			})
			.collect()
	}

	pub async fn run(self, drain: DrainWatcher) {
		let mut accept_loops = JoinSet::new();
		for (country, listener) in self.listeners {
			accept_loops.spawn(run_listener(
				self.pi.clone(),
				country,
				listener,
				drain.clone(),
			));
		}
		while let Some(res) = accept_loops.join_next().await {
			if let Err(e) = res {
				warn!("splice accept loop failed: {e}");
			}
		}
	}
}

async fn run_listener(
	pi: Arc<ProxyInputs>,
	country: Strng,
	listener: TcpListener,
	drain: DrainWatcher,
) {
	let shutdown = drain.wait_for_drain();
	tokio::pin!(shutdown);
	loop {
		tokio::select! {
			res = listener.accept() => {
				match res {
					Ok((client, remote)) => {
						debug!(country = %country, %remote, "accept event on country port");
						let pi = pi.clone();
						let country = country.clone();
						tokio::spawn(async move {
							handle_client(pi, country, client).await;
						});
					},
					Err(e) => warn!(country = %country, "client accept failed: {e}"),
				}
			}
			_ = &mut shutdown => {
				info!(country = %country, "splice listener stopped");
				return;
			}
		}
	}
}

async fn handle_client(pi: Arc<ProxyInputs>, country: Strng, client: TcpStream) {
	let agent = match pi.pool.pop_by_country(&country) {
		Ok(agent) => agent,
		Err(e) => {
			error!("{e}");
			pi.metrics.splices_rejected.inc();
			// Dropping the client closes it; there is no retry onto another
			// agent and no queueing.
			return;
		},
	};
	pi.metrics.splices_opened.inc();
	let id = SpliceId::next();
	let device_id = agent.conn.device_id.clone();
	// Held until teardown completes; dropping it clears the in-use entry.
	let lease = agent.guard;
	pi.plugins.register(id, &device_id);

	let (client_read, client_write) = client.into_split();
	let (agent_read, mut agent_write) = agent.conn.sock.into_split();
	let res = forward(&pi, id, client_read, client_write, agent_read, &mut agent_write).await;
	match res {
		Ok(()) => debug!(%id, device = %device_id, "splice closed"),
		Err(e) if e.is_broken_pipe() => debug!(%id, device = %device_id, "broken pipe on splice"),
		Err(e) => warn!(%id, device = %device_id, "splice torn down: {e}"),
	}

	// The agent uses this to reset its upstream and dial back in. It may
	// already be gone; that is fine.
	if let Err(e) = agent_write.write_all(CLOSING_SENTINEL).await {
		debug!(%id, "could not send closing sentinel: {e}");
	}
	pi.plugins.unregister(id);
	drop(lease);
	pi.metrics.splices_closed.inc();
}

async fn forward(
	pi: &ProxyInputs,
	id: SpliceId,
	mut client_read: OwnedReadHalf,
	mut client_write: OwnedWriteHalf,
	mut agent_read: OwnedReadHalf,
	agent_write: &mut OwnedWriteHalf,
) -> Result<(), SpliceError> {
	let mut client_buf = [0u8; SPLICE_READ_SIZE];
	let mut agent_buf = [0u8; SPLICE_READ_SIZE];
	loop {
		tokio::select! {
			res = client_read.read(&mut client_buf) => {
				let n = res.map_err(SpliceError::Client)?;
				if n == 0 {
					return Ok(());
				}
				agent_write
					.write_all(&client_buf[..n])
					.await
					.map_err(SpliceError::Agent)?;
				pi.metrics.bytes_from_client.inc_by(n as u64);
				pi.plugins.packet_transmitted(id, Side::Client, &client_buf[..n])?;
			}
			res = agent_read.read(&mut agent_buf) => {
				let n = res.map_err(SpliceError::Agent)?;
				if n == 0 {
					return Ok(());
				}
				client_write
					.write_all(&agent_buf[..n])
					.await
					.map_err(SpliceError::Client)?;
				pi.metrics.bytes_from_agent.inc_by(n as u64);
				pi.plugins.packet_transmitted(id, Side::Agent, &agent_buf[..n])?;
			}
		}
	}
}

#[cfg(test)]
#[path = "splice_tests.rs"]
mod tests;
