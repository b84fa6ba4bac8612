//! Byte accounting per agent, split by direction. Bytes sourced from the
//! agent count against the device's download allowance, bytes sourced from
//! the client against upload. Totals are flushed to the store when the
//! splice closes.

use std::collections::HashMap;

use peer_core::prelude::*;

use crate::plugin::{ConnectionInvalid, Side, SpliceId, SplicePlugin};
use crate::store::{DataplanRecord, DocumentStore};

pub const DIRECTION_DOWNLOAD: &str = "download";
pub const DIRECTION_UPLOAD: &str = "upload";

#[derive(Debug)]
struct Usage {
	device_id: Strng,
	download: u64,
	upload: u64,
}

pub struct DataplanTracker {
	store: Arc<dyn DocumentStore>,
	splices: Mutex<HashMap<SpliceId, Usage>>,
}

impl DataplanTracker {
	pub fn new(store: Arc<dyn DocumentStore>) -> Self {
		DataplanTracker {
			store,
			splices: Mutex::new(HashMap::new()),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SpliceId, Usage>> {
		self.splices.lock().expect("dataplan lock poisoned")
	}

	fn flush(&self, usage: &Usage) {
		info!(
			device = %usage.device_id,
			download = usage.download,
			upload = usage.upload,
			"flushing data-plan usage"
		);
		for (direction, amount) in [
			(DIRECTION_DOWNLOAD, usage.download),
			(DIRECTION_UPLOAD, usage.upload),
		] {
			if let Err(e) = self.store.record_dataplan(DataplanRecord {
				device_id: usage.device_id.clone(),
				direction: strng::new(direction),
				amount,
			}) {
				warn!("failed to record data-plan usage: {e}");
			}
		}
	}
}

impl SplicePlugin for DataplanTracker {
	fn register(&self, id: SpliceId, device_id: &Strng) {
		self.lock().insert(
			id,
			Usage {
				device_id: device_id.clone(),
				download: 0,
				upload: 0,
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
		let Some(usage) = splices.get_mut(&id) else {
			warn!(%id, "packet for unknown splice");
			return Ok(());
		};
		match source {
			Side::Agent => usage.download += data.len() as u64,
			Side::Client => usage.upload += data.len() as u64,
		}
		Ok(())
	}

	fn unregister(&self, id: SpliceId) {
		let Some(usage) = self.lock().remove(&id) else {
			warn!(%id, "unregister for unknown splice");
			return;
		};
		self.flush(&usage);
	}
}

#[cfg(test)]
mod tests {
	use peer_core::prelude::*;

	use super::*;
	use crate::store::MemoryStore;

	#[test]
	fn counts_by_direction_and_flushes_on_unregister() {
		let store = Arc::new(MemoryStore::default());
		let tracker = DataplanTracker::new(store.clone());
		let id = SpliceId::next();
		let device = strng::new("device-1");

		tracker.register(id, &device);
		tracker.packet_transmitted(id, Side::Client, b"hello").unwrap();
		tracker
			.packet_transmitted(id, Side::Agent, b"a response")
			.unwrap();
		tracker.packet_transmitted(id, Side::Agent, b"!").unwrap();
		tracker.unregister(id);

		let rows = store.dataplan_rows().unwrap();
		assert_eq!(rows.len(), 2);
		let download = rows
			.iter()
			.find(|r| r.direction == DIRECTION_DOWNLOAD)
			.unwrap();
		let upload = rows.iter().find(|r| r.direction == DIRECTION_UPLOAD).unwrap();
		assert_eq!(download.amount, 11);
		assert_eq!(upload.amount, 5);
		assert_eq!(download.device_id, device);

		// A second unregister has nothing left to flush.
		tracker.unregister(id);
		assert_eq!(store.dataplan_rows().unwrap().len(), 2);
	}

	#[test]
	fn packets_for_unknown_splices_are_ignored() {
		let store = Arc::new(MemoryStore::default());
		let tracker = DataplanTracker::new(store);
		assert!(
			tracker
				.packet_transmitted(SpliceId::next(), Side::Client, b"x")
				.is_ok()
		);
	}
}
