//! Reverse-direction proxy fabric.
//!
//! Mobile agents dial in and idle in the [`pool`]; external clients hit the
//! per-country ports owned by the [`proxy::splice`] engine, which pairs each
//! client with an agent and forwards bytes under the watch of the
//! [`plugin`]s.

use peer_core::prelude::*;

pub mod admin;
pub mod app;
pub mod config;
pub mod geo;
pub mod metrics;
pub mod plugin;
pub mod pool;
pub mod proxy;
pub mod store;
pub mod tasks;
pub mod transport;
pub mod wake;
pub mod whitelist;

pub use config::Config;

/// Everything the data plane needs, shared across the ingress, the splice
/// engine, and the plugins.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub pool: Arc<pool::ConnectionPool>,
	pub store: Arc<dyn store::DocumentStore>,
	pub geo: Arc<dyn geo::Lookup>,
	pub plugins: plugin::PluginSet,
	pub metrics: Arc<metrics::Metrics>,
}
