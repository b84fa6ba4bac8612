//! Per-splice protocol state machine.
//!
//! Classifies each splice as SOCKS5 or HTTPS-CONNECT from its first chunk
//! and validates every subsequent chunk against the current state. Any
//! violation vetoes the splice. The whitelist check is observability only:
//! a target outside the resolved set raises an alert, never a veto.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use peer_core::prelude::*;
use regex::Regex;
use thiserror::Error;

use crate::plugin::{ConnectionInvalid, Side, SpliceId, SplicePlugin};
use crate::store::{DocumentStore, TargetRecord};
use crate::whitelist::WhitelistResolver;

pub const ALERT_PROTOCOL: &str = "ALERT-PROTOCOL";
pub const ALERT_IP: &str = "ALERT-IP";

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const STANDARD_PORTS: [u16; 2] = [80, 443];
const HTTPS_CONNECT_METHOD: &str = "CONNECT";

static TARGET_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)").expect("static regex"));

/// Splice protocol phases. Chunks processed in odd phases originate from the
/// external client, even phases from the agent; `Unclassified` additionally
/// admits the client's opening chunk and `ConnectionComplete` admits both
/// directions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
	Unclassified = 0,
	SocksInitial = 1,
	SocksAuthMethodsSent = 2,
	SocksNegotiationComplete = 3,
	SocksConnectRequestSent = 4,
	HttpsInitial = 5,
	HttpsConnectSent = 6,
	ConnectionComplete = 7,
}

impl ConnectionState {
	fn client_turn(self) -> bool {
		(self as u8) % 2 == 1
	}

	/// The successor state once a chunk validates. `ConnectionComplete` is
	/// absorbing, and the SOCKS reply jumps straight there rather than
	/// falling into the HTTPS chain.
	fn advance(self) -> ConnectionState {
		use ConnectionState::*;
		match self {
			Unclassified => SocksInitial,
			SocksInitial => SocksAuthMethodsSent,
			SocksAuthMethodsSent => SocksNegotiationComplete,
			SocksNegotiationComplete => SocksConnectRequestSent,
			SocksConnectRequestSent => ConnectionComplete,
			HttpsInitial => HttpsConnectSent,
			HttpsConnectSent => ConnectionComplete,
			ConnectionComplete => ConnectionComplete,
		}
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Violation {
	#[error("packet is not expected in this state from this socket")]
	UnexpectedSource,
	#[error("packet is too short for this state")]
	Truncated,
	#[error("socks packet did not start with 0x05")]
	BadSocksVersion,
	#[error("packet length does not match number of authentication methods")]
	AuthMethodsLength,
	#[error("authentication method chosen is not NO_AUTH (0x00)")]
	NotNoAuth,
	#[error("connection type is not CONNECT (0x01)")]
	UnsupportedCommand,
	#[error("reserved byte is invalid (!= 0x00)")]
	BadReservedByte,
	#[error("address type is not supported (IPv6 or DNS)")]
	NotIpv4,
	#[error("socks response was not successful, expected 0x00 received {0:#04x}")]
	ResponseFailure(u8),
	#[error("first HTTPS packet should start with CONNECT")]
	NotConnect,
	#[error("first HTTPS packet should hold the ip and port to connect to")]
	NoAddressFound,
}

#[derive(Debug)]
struct SpliceState {
	device_id: Strng,
	state: ConnectionState,
	target_ip: Option<Ipv4Addr>,
	target_port: u16,
}

pub struct ProtocolMonitor {
	store: Arc<dyn DocumentStore>,
	whitelist: Option<Arc<WhitelistResolver>>,
	splices: Mutex<HashMap<SpliceId, SpliceState>>,
}

impl ProtocolMonitor {
	pub fn new(store: Arc<dyn DocumentStore>, whitelist: Option<Arc<WhitelistResolver>>) -> Self {
		ProtocolMonitor {
			store,
			whitelist,
			splices: Mutex::new(HashMap::new()),
		}
	}

	#[cfg(test)]
	pub fn state_of(&self, id: SpliceId) -> Option<ConnectionState> {
		self.lock().get(&id).map(|s| s.state)
	}

	#[cfg(test)]
	pub fn target_of(&self, id: SpliceId) -> Option<(Ipv4Addr, u16)> {
		self
			.lock()
			.get(&id)
			.and_then(|s| s.target_ip.map(|ip| (ip, s.target_port)))
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SpliceId, SpliceState>> {
		self.splices.lock().expect("monitor lock poisoned")
	}

	fn validate(&self, splice: &mut SpliceState, data: &[u8]) -> Result<(), Violation> {
		use ConnectionState::*;
		match splice.state {
			Unclassified => {
				splice.state = if data.first() == Some(&SOCKS_VERSION) {
					SocksInitial
				} else {
					HttpsInitial
				};
				self.validate(splice, data)
			},
			SocksInitial => {
				socks_version(data)?;
				if data.len() != at(data, 1)? as usize + 2 {
					return Err(Violation::AuthMethodsLength);
				}
				Ok(())
			},
			SocksAuthMethodsSent => {
				socks_version(data)?;
				if at(data, 1)? != 0x00 {
					return Err(Violation::NotNoAuth);
				}
				Ok(())
			},
			SocksNegotiationComplete => {
				socks_version(data)?;
				if at(data, 1)? != SOCKS_CMD_CONNECT {
					return Err(Violation::UnsupportedCommand);
				}
				if at(data, 2)? != 0x00 {
					return Err(Violation::BadReservedByte);
				}
				if at(data, 3)? != SOCKS_ATYP_IPV4 {
					return Err(Violation::NotIpv4);
				}
				if data.len() < 10 {
					return Err(Violation::Truncated);
				}
				let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
				let port = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);
				if !STANDARD_PORTS.contains(&port) {
					warn!(splice = %splice.device_id, port, "port is not in standard ports");
				}
				self.process_new_target(splice, ip, port);
				Ok(())
			},
			SocksConnectRequestSent => {
				socks_version(data)?;
				let status = at(data, 1)?;
				if status != 0x00 {
					return Err(Violation::ResponseFailure(status));
				}
				if at(data, 2)? != 0x00 {
					return Err(Violation::BadReservedByte);
				}
				if at(data, 3)? != SOCKS_ATYP_IPV4 {
					return Err(Violation::NotIpv4);
				}
				Ok(())
			},
			HttpsInitial => {
				let text = String::from_utf8_lossy(data);
				if !text.starts_with(HTTPS_CONNECT_METHOD) {
					return Err(Violation::NotConnect);
				}
				let captures = TARGET_RE.captures(&text).ok_or(Violation::NoAddressFound)?;
				let ip: Ipv4Addr = captures[1].parse().map_err(|_| Violation::NoAddressFound)?;
				let port: u16 = captures[2].parse().map_err(|_| Violation::NoAddressFound)?;
				self.process_new_target(splice, ip, port);
				Ok(())
			},
			HttpsConnectSent | ConnectionComplete => Ok(()),
		}
	}

	fn process_new_target(&self, splice: &mut SpliceState, ip: Ipv4Addr, port: u16) {
		splice.target_ip = Some(ip);
		splice.target_port = port;
		info!(device = %splice.device_id, target = %ip, port, "splice connected to a new target");
		if let Some(whitelist) = &self.whitelist {
			if !whitelist.subnet_match(ip) {
				warn!(
					alert = ALERT_IP,
					device = %splice.device_id,
					target = %ip,
					"target ip is not associated with any whitelisted address"
				);
			}
		}
		if let Err(e) = self.store.record_target(TargetRecord {
			device_id: splice.device_id.clone(),
			target_ip: ip,
			target_port: port,
		}) {
			warn!("failed to record splice target: {e}");
		}
	}
}

impl SplicePlugin for ProtocolMonitor {
	fn register(&self, id: SpliceId, device_id: &Strng) {
		self.lock().insert(
			id,
			SpliceState {
				device_id: device_id.clone(),
				state: ConnectionState::Unclassified,
				target_ip: None,
				target_port: 0,
			},
		);
	}

	fn packet_transmitted(
		&self,
		id: SpliceId,
		source: Side,
		data: &[u8],
	) -> Result<(), ConnectionInvalid> {
		let mut splices = self.lock();
		let Some(splice) = splices.get_mut(&id) else {
			warn!(%id, "packet for unknown splice");
			return Ok(());
		};
		let state = splice.state;
		let expected = state.client_turn() == (source == Side::Client)
			|| state == ConnectionState::ConnectionComplete
			|| (state == ConnectionState::Unclassified && source == Side::Client);
		if !expected {
			return Err(invalid(splice, state, Violation::UnexpectedSource));
		}
		self
			.validate(splice, data)
			.map_err(|v| invalid(splice, state, v))?;
		splice.state = splice.state.advance();
		Ok(())
	}

	fn unregister(&self, id: SpliceId) {
		self.lock().remove(&id);
	}
}

fn invalid(splice: &SpliceState, state: ConnectionState, violation: Violation) -> ConnectionInvalid {
	error!(
		alert = ALERT_PROTOCOL,
		device = %splice.device_id,
		state = ?state,
		"invalid state occurred: {violation}"
	);
	ConnectionInvalid(violation.to_string())
}

fn socks_version(data: &[u8]) -> Result<(), Violation> {
	if at(data, 0)? != SOCKS_VERSION {
		return Err(Violation::BadSocksVersion);
	}
	Ok(())
}

fn at(data: &[u8], idx: usize) -> Result<u8, Violation> {
	data.get(idx).copied().ok_or(Violation::Truncated)
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
