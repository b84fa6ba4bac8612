//! Inbound side for agents.
//!
//! Agents dial this listener, present a fixed-size identity frame, and are
//! enrolled into the pool tagged with whatever the geo lookup can attribute
//! to their source address. The socket then idles in the pool until the
//! splice engine withdraws it.

use std::time::SystemTime;

use once_cell::sync::Lazy;
use peer_core::drain::DrainWatcher;
use peer_core::prelude::*;
use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::ProxyInputs;
use crate::geo::NOT_AVAILABLE;
use crate::plugin::monitor::ALERT_PROTOCOL;
use crate::pool::AgentConnection;
use crate::store::DeviceRecord;
use crate::transport;

pub const IMEI_LEN: usize = 32;
pub const FCM_ID_LEN: usize = 250;
pub const APP_VERSION_LEN: usize = 4;
/// `IMEI "," FCM_ID ["," APP_VERSION]`, one separator accounted for.
const IDENTITY_FRAME_LEN: usize = IMEI_LEN + FCM_ID_LEN + APP_VERSION_LEN + 1;
const BACKLOG: i32 = 1;

static FIELD_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9]*$").expect("static regex"));

#[derive(Error, Debug)]
pub enum IngressError {
	#[error("identity frame should be IMEI,FCM_ID[,APP_VERSION]: {0}")]
	ProtocolAnomaly(&'static str),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
	pub imei: Strng,
	pub fcm_id: Strng,
	pub app_version: Strng,
}

pub struct AgentIngress {
	pi: Arc<ProxyInputs>,
	listener: TcpListener,
}

impl AgentIngress {
	pub fn bind(pi: Arc<ProxyInputs>) -> anyhow::Result<AgentIngress> {
		let addr = SocketAddr::from(([0, 0, 0, 0], pi.cfg.peer_server_port));
		let listener = transport::bind_listener(addr, BACKLOG)?;
		info!(addr = %listener.local_addr()?, "agent ingress listening");
		Ok(AgentIngress { pi, listener })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.listener.local_addr().expect("listener has an address")
	}

	pub async fn run(self, drain: DrainWatcher) {
		let shutdown = drain.wait_for_drain();
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				res = self.listener.accept() => {
					match res {
						Ok((sock, remote)) => {
							if !admitted(remote.ip()) {
								error!(%remote, "invalid connection");
								continue;
							}
							info!(%remote, "received new agent connection");
							let pi = self.pi.clone();
							tokio::spawn(async move {
								if let Err(e) = enroll(pi, sock, remote).await {
									error!(%remote, "failed to enroll agent: {e}");
								}
							});
						},
						Err(e) => warn!("agent accept failed: {e}"),
					}
				}
				_ = &mut shutdown => {
					info!("agent ingress stopped");
					return;
				}
			}
		}
	}
}

/// Source-address admission. Currently permissive.
fn admitted(_ip: IpAddr) -> bool {
	true
}

async fn enroll(pi: Arc<ProxyInputs>, mut sock: TcpStream, remote: SocketAddr) -> anyhow::Result<()> {
	let (country_code, asn) = match pi.geo.locate(remote.ip()) {
		Some(location) => (location.country_code, location.asn),
		None => {
			debug!(%remote, "no country/asn attribution, using sentinel");
			(NOT_AVAILABLE, NOT_AVAILABLE)
		},
	};
	let identity = read_identity_frame(&mut sock).await?;
	pi.store.upsert_device(DeviceRecord {
		imei: identity.imei.clone(),
		fcm_id: identity.fcm_id,
		asn: asn.clone(),
		country_code: country_code.clone(),
		ip: remote.ip(),
		app_version: identity.app_version,
		last_connect_timestamp: SystemTime::now(),
	})?;
	pi.pool.insert(AgentConnection {
		sock,
		country_code,
		asn,
		device_id: identity.imei,
	});
	pi.metrics.agent_enrollments.inc();
	Ok(())
}

async fn read_identity_frame(sock: &mut TcpStream) -> Result<AgentIdentity, IngressError> {
	let mut buf = [0u8; IDENTITY_FRAME_LEN];
	let n = sock.read(&mut buf).await?;
	if n == 0 {
		return Err(IngressError::ProtocolAnomaly("empty identity frame"));
	}
	parse_identity(&buf[..n])
}

pub(crate) fn parse_identity(raw: &[u8]) -> Result<AgentIdentity, IngressError> {
	let text =
		std::str::from_utf8(raw).map_err(|_| IngressError::ProtocolAnomaly("frame is not utf-8"))?;
	let mut fields = text.split(',');
	let imei = fields.next().unwrap_or_default();
	let Some(fcm_id) = fields.next() else {
		return Err(IngressError::ProtocolAnomaly("missing fcm_id"));
	};
	let app_version = fields.next().unwrap_or("0");
	if !FIELD_RE.is_match(imei) || !FIELD_RE.is_match(fcm_id) {
		error!(
			alert = ALERT_PROTOCOL,
			imei, "received unexpected device details"
		);
		return Err(IngressError::ProtocolAnomaly(
			"imei and fcm_id must be alphanumeric",
		));
	}
	Ok(AgentIdentity {
		imei: strng::new(imei),
		fcm_id: strng::new(fcm_id),
		app_version: strng::new(app_version),
	})
}

#[cfg(test)]
#[path = "ingress_tests.rs"]
mod tests;
