//! Periodic housekeeping over the document store.
//!
//! Two jobs: dropping devices that have not dialed in for a week, and
//! regenerating the per-country ASN digests that back the admin surface.
//! Both are recurring ticks that stop on drain.

use std::collections::HashMap;
use std::time::SystemTime;

use itertools::Itertools;
use peer_core::drain::DrainWatcher;
use peer_core::prelude::*;

use crate::store::{AvailableAsns, DocumentStore};

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

const CLEAN_DEVICES_INTERVAL: Duration = Duration::from_secs(12 * HOUR);
const STALE_DEVICE_THRESHOLD: Duration = Duration::from_secs(7 * DAY);
const ASN_REFRESH_INTERVAL: Duration = Duration::from_secs(HOUR);

pub fn spawn(store: Arc<dyn DocumentStore>, drain: DrainWatcher) {
	tokio::spawn(run(store, drain));
}

async fn run(store: Arc<dyn DocumentStore>, drain: DrainWatcher) {
	let mut clean = tokio::time::interval(CLEAN_DEVICES_INTERVAL);
	clean.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	let mut refresh = tokio::time::interval(ASN_REFRESH_INTERVAL);
	refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	clean.tick().await;
	refresh.tick().await;

	let shutdown = drain.wait_for_drain();
	tokio::pin!(shutdown);
	loop {
		tokio::select! {
			_ = clean.tick() => clean_devices(store.as_ref()),
			_ = refresh.tick() => refresh_asn_lists(store.as_ref()),
			_ = &mut shutdown => {
				debug!("housekeeping stopped");
				return;
			},
		}
	}
}

/// Remove devices that have not connected within the threshold.
pub fn clean_devices(store: &dyn DocumentStore) {
	info!("started clean devices task");
	let cutoff = SystemTime::now()
		.checked_sub(STALE_DEVICE_THRESHOLD)
		.unwrap_or(SystemTime::UNIX_EPOCH);
	match store.remove_devices_last_seen_before(cutoff) {
		Ok(removed) => info!(
			removed,
			threshold_secs = STALE_DEVICE_THRESHOLD.as_secs(),
			"clean devices task finished"
		),
		Err(e) => error!("clean devices task failed: {e}"),
	}
}

/// Regenerate the country → ASN digests from the device collection.
pub fn refresh_asn_lists(store: &dyn DocumentStore) {
	info!("started refresh asn list task");
	let devices = match store.devices() {
		Ok(devices) => devices,
		Err(e) => {
			error!("refresh asn list task failed to read devices: {e}");
			return;
		},
	};
	let mut by_country: HashMap<Strng, Vec<Strng>> = HashMap::new();
	for device in devices {
		by_country
			.entry(device.country_code)
			.or_default()
			.push(device.asn);
	}
	let lists: Vec<AvailableAsns> = by_country
		.into_iter()
		.map(|(country, asns)| AvailableAsns {
			country,
			asns: asns.into_iter().sorted().dedup().collect(),
		})
		.collect();
	let countries = lists.len();
	match store.replace_available_asns(lists) {
		Ok(()) => info!(countries, "refreshed available asn lists"),
		Err(e) => error!("refresh asn list task failed: {e}"),
	}
}

#[cfg(test)]
mod tests {
	use std::time::SystemTime;

	use peer_core::prelude::*;

	use super::*;
	use crate::store::{DeviceRecord, MemoryStore};

	fn device(imei: &str, country: &str, asn: &str, last_seen: SystemTime) -> DeviceRecord {
		DeviceRecord {
			imei: strng::new(imei),
			fcm_id: strng::new("fcm"),
			asn: strng::new(asn),
			country_code: strng::new(country),
			ip: "10.0.0.1".parse().unwrap(),
			app_version: strng::new("1"),
			last_connect_timestamp: last_seen,
		}
	}

	#[test]
	fn clean_devices_drops_only_stale_entries() {
		let store = MemoryStore::default();
		let now = SystemTime::now();
		let stale = now - (STALE_DEVICE_THRESHOLD + Duration::from_secs(60));
		store.upsert_device(device("old", "us", "1", stale)).unwrap();
		store.upsert_device(device("new", "us", "1", now)).unwrap();

		clean_devices(&store);

		let devices = store.devices().unwrap();
		assert_eq!(devices.len(), 1);
		assert_eq!(devices[0].imei, "new");
	}

	#[test]
	fn asn_lists_are_grouped_and_deduplicated() {
		let store = MemoryStore::default();
		let now = SystemTime::now();
		store.upsert_device(device("1", "us", "100", now)).unwrap();
		store.upsert_device(device("2", "us", "100", now)).unwrap();
		store.upsert_device(device("3", "us", "200", now)).unwrap();
		store.upsert_device(device("4", "uk", "300", now)).unwrap();

		refresh_asn_lists(&store);

		let mut lists = store.available_asns().unwrap();
		lists.sort_by(|a, b| a.country.cmp(&b.country));
		assert_eq!(lists.len(), 2);
		assert_eq!(lists[0].country, "uk");
		assert_eq!(lists[0].asns, vec![strng::new("300")]);
		assert_eq!(lists[1].country, "us");
		assert_eq!(lists[1].asns, vec![strng::new("100"), strng::new("200")]);
	}
}
