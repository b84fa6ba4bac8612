//! Periodic DNS resolution of the allowed upstream hostnames.
//!
//! The monitor consults the cached A records when a splice declares its
//! target. Resolution runs on a true recurring tick; entries that stop
//! resolving age out after a fixed number of refresh intervals.

use std::collections::HashMap;
use std::sync::RwLock;

use hickory_resolver::TokioResolver;
use hickory_resolver::name_server::TokioConnectionProvider;
use peer_core::drain::DrainWatcher;
use peer_core::prelude::*;
use tokio::task::JoinSet;

/// Entries survive this many missed refreshes before they are dropped.
const CACHE_EXPIRY_INTERVALS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	pub hosts: Vec<Strng>,
	pub refresh_interval: Duration,
}

enum Resolver {
	Real(TokioResolver),
	#[cfg(test)]
	Mock(Mutex<HashMap<String, Vec<Ipv4Addr>>>),
}

impl Resolver {
	async fn resolve(&self, host: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
		match self {
			Resolver::Real(resolver) => {
				let lookup = resolver.lookup_ip(host).await?;
				Ok(
					lookup
						.iter()
						.filter_map(|ip| match ip {
							IpAddr::V4(v4) => Some(v4),
							IpAddr::V6(_) => None,
						})
						.collect(),
				)
			},
			#[cfg(test)]
			Resolver::Mock(entries) => Ok(
				entries
					.lock()
					.expect("mock lock poisoned")
					.get(host)
					.cloned()
					.unwrap_or_default(),
			),
		}
	}
}

pub struct WhitelistResolver {
	hosts: Vec<Strng>,
	refresh_interval: Duration,
	resolver: Arc<Resolver>,
	ips: RwLock<HashMap<Ipv4Addr, Instant>>,
}

impl WhitelistResolver {
	pub fn new(cfg: &Config) -> anyhow::Result<Arc<Self>> {
		let (resolver_cfg, resolver_opts) = hickory_resolver::system_conf::read_system_conf()?;
		let mut builder = hickory_resolver::Resolver::builder_with_config(
			resolver_cfg,
			TokioConnectionProvider::default(),
		);
		*builder.options_mut() = resolver_opts;
		Ok(Arc::new(WhitelistResolver {
			hosts: cfg.hosts.clone(),
			refresh_interval: cfg.refresh_interval,
			resolver: Arc::new(Resolver::Real(builder.build())),
			ips: RwLock::new(HashMap::new()),
		}))
	}

	#[cfg(test)]
	pub fn with_mock(
		hosts: Vec<Strng>,
		refresh_interval: Duration,
		entries: HashMap<String, Vec<Ipv4Addr>>,
	) -> Arc<Self> {
		Arc::new(WhitelistResolver {
			hosts,
			refresh_interval,
			resolver: Arc::new(Resolver::Mock(Mutex::new(entries))),
			ips: RwLock::new(HashMap::new()),
		})
	}

	#[cfg(test)]
	pub fn set_mock_entries(&self, entries: HashMap<String, Vec<Ipv4Addr>>) {
		match &*self.resolver {
			Resolver::Mock(mock) => *mock.lock().expect("mock lock poisoned") = entries,
			Resolver::Real(_) => panic!("not a mock resolver"),
		}
	}

	pub async fn run(self: Arc<Self>, drain: DrainWatcher) {
		let mut tick = tokio::time::interval(self.refresh_interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let shutdown = drain.wait_for_drain();
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				_ = tick.tick() => self.refresh().await,
				_ = &mut shutdown => {
					debug!("whitelist resolver stopped");
					return;
				},
			}
		}
	}

	/// Resolve every configured host concurrently and fold the results into
	/// the cache, pruning entries that have not resolved recently.
	pub async fn refresh(&self) {
		let mut lookups = JoinSet::new();
		for host in &self.hosts {
			let host = host.clone();
			let resolver = self.resolver.clone();
			lookups.spawn(async move {
				debug!(host = %host, "resolving whitelist host");
				let res = resolver.resolve(&host).await;
				(host, res)
			});
		}
		let now = Instant::now();
		let mut resolved = Vec::new();
		while let Some(res) = lookups.join_next().await {
			match res {
				Ok((_, Ok(ips))) => resolved.extend(ips),
				Ok((host, Err(e))) => warn!(host = %host, "whitelist resolution failed: {e}"),
				Err(e) => warn!("whitelist resolution task failed: {e}"),
			}
		}
		let expiry = self.refresh_interval * CACHE_EXPIRY_INTERVALS;
		let mut cache = self.ips.write().expect("whitelist lock poisoned");
		for ip in resolved {
			cache.insert(ip, now);
		}
		cache.retain(|_, refreshed| now.duration_since(*refreshed) < expiry);
	}

	/// Membership up to the first three octets, the granularity the upstream
	/// services keep their address pools in.
	pub fn subnet_match(&self, ip: Ipv4Addr) -> bool {
		let cache = self.ips.read().expect("whitelist lock poisoned");
		cache
			.keys()
			.any(|known| known.octets()[..3] == ip.octets()[..3])
	}
}

#[cfg(test)]
#[path = "whitelist_tests.rs"]
mod tests;
