//! The document store the proxy reports into.
//!
//! The backing database is an external collaborator; the core only depends on
//! [`DocumentStore`]. [`MemoryStore`] is the in-process implementation used by
//! the binary and by tests. Collections mirror the persisted schemas:
//! device details (keyed by imei), observed splice targets, data-plan usage
//! rows, push-command audit, and the hourly country→ASN digests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use peer_core::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
	pub imei: Strng,
	pub fcm_id: Strng,
	pub asn: Strng,
	pub country_code: Strng,
	pub ip: IpAddr,
	pub app_version: Strng,
	pub last_connect_timestamp: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
	pub device_id: Strng,
	pub target_ip: Ipv4Addr,
	pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplanRecord {
	pub device_id: Strng,
	pub direction: Strng,
	pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
	pub fcm_ids: Vec<Strng>,
	pub command_type: u8,
	pub success_count: usize,
	pub failure_count: usize,
	pub timestamp: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableAsns {
	pub country: Strng,
	pub asns: Vec<Strng>,
}

pub trait DocumentStore: Send + Sync {
	fn upsert_device(&self, record: DeviceRecord) -> anyhow::Result<()>;
	fn devices(&self) -> anyhow::Result<Vec<DeviceRecord>>;
	fn count_devices_by_country(&self) -> anyhow::Result<HashMap<Strng, usize>>;
	fn fcm_ids_by_imei(&self, imei: &str) -> anyhow::Result<Vec<Strng>>;
	fn fcm_ids_by_country(&self, country_code: &str) -> anyhow::Result<Vec<Strng>>;
	fn fcm_ids_by_ip(&self, ip: IpAddr) -> anyhow::Result<Vec<Strng>>;
	fn remove_devices_last_seen_before(&self, cutoff: SystemTime) -> anyhow::Result<usize>;

	fn record_target(&self, record: TargetRecord) -> anyhow::Result<()>;
	fn record_dataplan(&self, record: DataplanRecord) -> anyhow::Result<()>;
	fn record_command(&self, record: CommandRecord) -> anyhow::Result<()>;

	fn replace_available_asns(&self, lists: Vec<AvailableAsns>) -> anyhow::Result<()>;
	fn available_asns(&self) -> anyhow::Result<Vec<AvailableAsns>>;

	fn targets(&self) -> anyhow::Result<Vec<TargetRecord>>;
	fn dataplan_rows(&self) -> anyhow::Result<Vec<DataplanRecord>>;
	fn commands(&self) -> anyhow::Result<Vec<CommandRecord>>;
}

#[derive(Default)]
pub struct MemoryStore {
	inner: RwLock<Collections>,
}

#[derive(Default)]
struct Collections {
	devices: HashMap<Strng, DeviceRecord>,
	targets: Vec<TargetRecord>,
	dataplan: Vec<DataplanRecord>,
	commands: Vec<CommandRecord>,
	available_asns: Vec<AvailableAsns>,
}

impl MemoryStore {
	fn read(&self) -> std::sync::RwLockReadGuard<'_, Collections> {
		self.inner.read().expect("store lock poisoned")
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, Collections> {
		self.inner.write().expect("store lock poisoned")
	}
}

impl DocumentStore for MemoryStore {
	fn upsert_device(&self, record: DeviceRecord) -> anyhow::Result<()> {
		self.write().devices.insert(record.imei.clone(), record);
		Ok(())
	}

	fn devices(&self) -> anyhow::Result<Vec<DeviceRecord>> {
		Ok(self.read().devices.values().cloned().collect())
	}

	fn count_devices_by_country(&self) -> anyhow::Result<HashMap<Strng, usize>> {
		let mut counts: HashMap<Strng, usize> = HashMap::new();
		for device in self.read().devices.values() {
			*counts.entry(device.country_code.clone()).or_default() += 1;
		}
		Ok(counts)
	}

	fn fcm_ids_by_imei(&self, imei: &str) -> anyhow::Result<Vec<Strng>> {
		Ok(
			self
				.read()
				.devices
				.get(imei)
				.map(|d| vec![d.fcm_id.clone()])
				.unwrap_or_default(),
		)
	}

	fn fcm_ids_by_country(&self, country_code: &str) -> anyhow::Result<Vec<Strng>> {
		Ok(
			self
				.read()
				.devices
				.values()
				.filter(|d| d.country_code == country_code)
				.map(|d| d.fcm_id.clone())
				.collect(),
		)
	}

	fn fcm_ids_by_ip(&self, ip: IpAddr) -> anyhow::Result<Vec<Strng>> {
		Ok(
			self
				.read()
				.devices
				.values()
				.filter(|d| d.ip == ip)
				.map(|d| d.fcm_id.clone())
				.collect(),
		)
	}

	fn remove_devices_last_seen_before(&self, cutoff: SystemTime) -> anyhow::Result<usize> {
		let mut inner = self.write();
		let before = inner.devices.len();
		inner
			.devices
			.retain(|_, d| d.last_connect_timestamp >= cutoff);
		Ok(before - inner.devices.len())
	}

	fn record_target(&self, record: TargetRecord) -> anyhow::Result<()> {
		self.write().targets.push(record);
		Ok(())
	}

	fn record_dataplan(&self, record: DataplanRecord) -> anyhow::Result<()> {
		self.write().dataplan.push(record);
		Ok(())
	}

	fn record_command(&self, record: CommandRecord) -> anyhow::Result<()> {
		self.write().commands.push(record);
		Ok(())
	}

	fn replace_available_asns(&self, lists: Vec<AvailableAsns>) -> anyhow::Result<()> {
		self.write().available_asns = lists;
		Ok(())
	}

	fn available_asns(&self) -> anyhow::Result<Vec<AvailableAsns>> {
		Ok(self.read().available_asns.clone())
	}

	fn targets(&self) -> anyhow::Result<Vec<TargetRecord>> {
		Ok(self.read().targets.clone())
	}

	fn dataplan_rows(&self) -> anyhow::Result<Vec<DataplanRecord>> {
		Ok(self.read().dataplan.clone())
	}

	fn commands(&self) -> anyhow::Result<Vec<CommandRecord>> {
		Ok(self.read().commands.clone())
	}
}
