use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use peer_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geo;
use crate::pool::KeepaliveConfig;
use crate::whitelist;

/// On-disk configuration shape. Every field is optional; [`parse_config`]
/// resolves the effective values, letting environment variables override the
/// file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
	pub peer_server_port: Option<u16>,
	pub frontend_port: Option<u16>,
	pub country_to_port: Option<HashMap<String, u16>>,
	pub max_threads: Option<usize>,
	pub service_whitelist_enabled: Option<bool>,
	pub service_whitelist: Option<Vec<String>>,
	pub whitelist_refresh_interval: Option<String>,
	pub geoip_asn_db: Option<PathBuf>,
	pub geoip_city_db: Option<PathBuf>,
	pub keepalive_interval: Option<String>,
	pub keepalive_probe_timeout: Option<String>,
	pub keepalive_attempts: Option<u32>,
	pub keepalive_retry_delay: Option<String>,
	pub used_purge_interval: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub peer_server_port: u16,
	pub frontend_port: u16,
	pub country_to_port: HashMap<Strng, u16>,
	pub max_threads: usize,
	pub whitelist: Option<whitelist::Config>,
	pub geoip: geo::Config,
	pub keepalive: KeepaliveConfig,
}

pub fn parse_config(contents: String, _filename: Option<PathBuf>) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(&contents)?;

	let country_to_port: HashMap<Strng, u16> = raw
		.country_to_port
		.unwrap_or_else(|| HashMap::from([(geo::NOT_AVAILABLE.to_string(), 1234)]))
		.into_iter()
		.map(|(country, port)| (strng::new(country), port))
		.collect();

	let whitelist_enabled = parse::<bool>("SERVICE_WHITELIST_ENABLED")?
		.or(raw.service_whitelist_enabled)
		.unwrap_or(false);
	let hosts: Vec<Strng> = raw
		.service_whitelist
		.unwrap_or_default()
		.iter()
		.map(strng::new)
		.collect();
	let whitelist = if whitelist_enabled && !hosts.is_empty() {
		Some(whitelist::Config {
			hosts,
			refresh_interval: parse_duration("WHITELIST_REFRESH_INTERVAL")?
				.or(raw
					.whitelist_refresh_interval
					.as_deref()
					.map(parse_duration_str)
					.transpose()?)
				.unwrap_or(Duration::from_secs(15)),
		})
	} else {
		None
	};

	let defaults = KeepaliveConfig::default();
	let keepalive = KeepaliveConfig {
		interval: parse_duration("KEEPALIVE_INTERVAL")?
			.or(raw
				.keepalive_interval
				.as_deref()
				.map(parse_duration_str)
				.transpose()?)
			.unwrap_or(defaults.interval),
		probe_timeout: parse_duration("KEEPALIVE_PROBE_TIMEOUT")?
			.or(raw
				.keepalive_probe_timeout
				.as_deref()
				.map(parse_duration_str)
				.transpose()?)
			.unwrap_or(defaults.probe_timeout),
		attempts: parse::<u32>("KEEPALIVE_ATTEMPTS")?
			.or(raw.keepalive_attempts)
			.unwrap_or(defaults.attempts),
		retry_delay: parse_duration("KEEPALIVE_RETRY_DELAY")?
			.or(raw
				.keepalive_retry_delay
				.as_deref()
				.map(parse_duration_str)
				.transpose()?)
			.unwrap_or(defaults.retry_delay),
		used_purge_interval: parse_duration("USED_PURGE_INTERVAL")?
			.or(raw
				.used_purge_interval
				.as_deref()
				.map(parse_duration_str)
				.transpose()?)
			.unwrap_or(defaults.used_purge_interval),
	};

	Ok(Config {
		peer_server_port: parse("PEER_SERVER_PORT")?
			.or(raw.peer_server_port)
			.unwrap_or(8000),
		frontend_port: parse("FRONTEND_PORT")?.or(raw.frontend_port).unwrap_or(8443),
		country_to_port,
		max_threads: parse("MAX_THREADS")?.or(raw.max_threads).unwrap_or(200),
		whitelist,
		geoip: geo::Config {
			asn_db: raw.geoip_asn_db,
			city_db: raw.geoip_city_db,
		},
		keepalive,
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?
		.map(|ds| parse_duration_str(&ds))
		.transpose()
}

fn parse_duration_str(ds: &str) -> anyhow::Result<Duration> {
	duration_str::parse(ds).map_err(|e| anyhow::anyhow!("invalid duration {ds} ({e})"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_from_empty_config() {
		let cfg = parse_config("{}".to_string(), None).unwrap();
		assert_eq!(cfg.peer_server_port, 8000);
		assert_eq!(cfg.frontend_port, 8443);
		assert_eq!(cfg.country_to_port[&geo::NOT_AVAILABLE], 1234);
		assert!(cfg.whitelist.is_none());
		assert_eq!(cfg.keepalive.attempts, 3);
		assert_eq!(cfg.keepalive.interval, Duration::from_secs(15 * 60));
	}

	#[test]
	fn full_config_round_trip() {
		let contents = r#"
peer_server_port: 9000
frontend_port: 9443
max_threads: 50
country_to_port:
  "N/A": 1234
  BE: 2000
  DE: 3000
service_whitelist_enabled: true
service_whitelist: ["www.ipinfo.io"]
whitelist_refresh_interval: 15s
keepalive_interval: 10m
keepalive_probe_timeout: 2s
keepalive_attempts: 5
"#;
		let cfg = parse_config(contents.to_string(), None).unwrap();
		assert_eq!(cfg.peer_server_port, 9000);
		assert_eq!(cfg.country_to_port.len(), 3);
		assert_eq!(cfg.country_to_port[&strng::new("DE")], 3000);
		let whitelist = cfg.whitelist.unwrap();
		assert_eq!(whitelist.hosts, vec![strng::new("www.ipinfo.io")]);
		assert_eq!(whitelist.refresh_interval, Duration::from_secs(15));
		assert_eq!(cfg.keepalive.interval, Duration::from_secs(600));
		assert_eq!(cfg.keepalive.attempts, 5);
	}

	#[test]
	fn whitelist_disabled_without_hosts() {
		let contents = "service_whitelist_enabled: true\n";
		let cfg = parse_config(contents.to_string(), None).unwrap();
		assert!(cfg.whitelist.is_none());
	}

	#[test]
	fn unknown_fields_are_rejected() {
		assert!(parse_config("does_not_exist: 1\n".to_string(), None).is_err());
	}
}
