//! Country/ASN attribution for dialing agents.
//!
//! The GeoIP databases themselves are an external concern; the proxy only
//! consumes this lookup interface. Agents that cannot be attributed are
//! bucketed under the `"N/A"` sentinel and remain fully usable.

use std::path::PathBuf;

use peer_core::prelude::*;

pub const NOT_AVAILABLE: Strng = strng::literal!("N/A");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
	pub country_code: Strng,
	pub asn: Strng,
}

pub trait Lookup: Send + Sync {
	fn locate(&self, ip: IpAddr) -> Option<Location>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
	pub asn_db: Option<PathBuf>,
	pub city_db: Option<PathBuf>,
}

/// No attribution available; everything lands in `"N/A"`.
#[derive(Debug, Default)]
pub struct Disabled;

impl Lookup for Disabled {
	fn locate(&self, _ip: IpAddr) -> Option<Location> {
		None
	}
}

pub fn from_config(cfg: &Config) -> Arc<dyn Lookup> {
	if cfg.asn_db.is_some() || cfg.city_db.is_some() {
		warn!(
			"GeoIP database paths are configured but no reader is wired in; \
			 agents will be bucketed as {NOT_AVAILABLE}"
		);
	}
	Arc::new(Disabled)
}
