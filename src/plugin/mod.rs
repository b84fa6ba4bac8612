//! Per-splice observers.
//!
//! The splice engine offers every forwarded chunk to a fixed set of plugins.
//! Plugins never see the sockets themselves; splices are identified by an
//! integer [`SpliceId`] and the side the chunk came from, so plugin state is
//! a plain id-keyed map with no reference cycles.

use std::sync::atomic::{AtomicU64, Ordering};

use peer_core::prelude::*;
use thiserror::Error;

pub mod dataplan;
pub mod monitor;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SpliceId(u64);

impl SpliceId {
	pub fn next() -> SpliceId {
		static NEXT: AtomicU64 = AtomicU64::new(0);
		SpliceId(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl Display for SpliceId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Which end of the splice a chunk was read from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Side {
	Client,
	Agent,
}

/// Raised by a plugin to veto the splice; the engine tears it down.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("splice is in an invalid state: {0}")]
pub struct ConnectionInvalid(pub String);

pub trait SplicePlugin: Send + Sync {
	fn register(&self, id: SpliceId, device_id: &Strng);
	fn packet_transmitted(
		&self,
		id: SpliceId,
		source: Side,
		data: &[u8],
	) -> Result<(), ConnectionInvalid>;
	fn unregister(&self, id: SpliceId);
}

#[derive(Clone, Default)]
pub struct PluginSet {
	plugins: Arc<Vec<Arc<dyn SplicePlugin>>>,
}

impl PluginSet {
	pub fn new(plugins: Vec<Arc<dyn SplicePlugin>>) -> Self {
		Self {
			plugins: Arc::new(plugins),
		}
	}

	pub fn register(&self, id: SpliceId, device_id: &Strng) {
		for plugin in self.plugins.iter() {
			plugin.register(id, device_id);
		}
	}

	pub fn packet_transmitted(
		&self,
		id: SpliceId,
		source: Side,
		data: &[u8],
	) -> Result<(), ConnectionInvalid> {
		for plugin in self.plugins.iter() {
			plugin.packet_transmitted(id, source, data)?;
		}
		Ok(())
	}

	pub fn unregister(&self, id: SpliceId) {
		for plugin in self.plugins.iter() {
			plugin.unregister(id);
		}
	}
}
