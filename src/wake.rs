//! Waking dormant agents.
//!
//! The push transport itself is an external collaborator behind
//! [`WakeChannel`]; this module resolves which push tokens a request fans
//! out to and keeps the audit trail of every attempt.

use std::time::SystemTime;

use async_trait::async_trait;
use peer_core::prelude::*;

use crate::store::{CommandRecord, DocumentStore};

/// Numbered commands the agent app understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
	WakeUp = 1,
	Airplane = 2,
	AppToFront = 3,
	DisableWifi = 4,
	EnableWifi = 5,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushOutcome {
	pub success: usize,
	pub failure: usize,
}

#[async_trait]
pub trait WakeChannel: Send + Sync {
	async fn push(&self, fcm_ids: &[Strng], command: Command) -> anyhow::Result<PushOutcome>;
}

/// Stand-in used when no push transport is wired in: logs the attempt and
/// reports every token as failed.
#[derive(Debug, Default)]
pub struct NullChannel;

#[async_trait]
impl WakeChannel for NullChannel {
	async fn push(&self, fcm_ids: &[Strng], command: Command) -> anyhow::Result<PushOutcome> {
		warn!(
			?command,
			tokens = fcm_ids.len(),
			"push channel is not configured; command dropped"
		);
		Ok(PushOutcome {
			success: 0,
			failure: fcm_ids.len(),
		})
	}
}

pub struct DeviceWaker {
	store: Arc<dyn DocumentStore>,
	channel: Arc<dyn WakeChannel>,
}

impl DeviceWaker {
	pub fn new(store: Arc<dyn DocumentStore>, channel: Arc<dyn WakeChannel>) -> Self {
		DeviceWaker { store, channel }
	}

	pub async fn wake_by_country(&self, country_code: &str) -> bool {
		info!(country_code, "waking up devices");
		let tokens = self
			.store
			.fcm_ids_by_country(country_code)
			.unwrap_or_default();
		self.send(Command::WakeUp, tokens).await
	}

	pub async fn wake_by_imei(&self, imei: &str) -> bool {
		info!(imei, "waking up device");
		let tokens = self.store.fcm_ids_by_imei(imei).unwrap_or_default();
		self.send(Command::WakeUp, tokens).await
	}

	/// Cycle the device radio so the agent comes back with a fresh address.
	pub async fn cycle_airplane(&self, ip: IpAddr) -> bool {
		info!(%ip, "switching airplane mode on and off");
		let tokens = self.store.fcm_ids_by_ip(ip).unwrap_or_default();
		self.send(Command::Airplane, tokens).await
	}

	async fn send(&self, command: Command, tokens: Vec<Strng>) -> bool {
		if tokens.is_empty() {
			return false;
		}
		let outcome = match self.channel.push(&tokens, command).await {
			Ok(outcome) => outcome,
			Err(e) => {
				error!("push failed: {e}");
				PushOutcome {
					success: 0,
					failure: tokens.len(),
				}
			},
		};
		if let Err(e) = self.store.record_command(CommandRecord {
			fcm_ids: tokens.clone(),
			command_type: command as u8,
			success_count: outcome.success,
			failure_count: outcome.failure,
			timestamp: SystemTime::now(),
		}) {
			warn!("failed to record command audit: {e}");
		}
		info!(
			?command,
			sent = tokens.len(),
			succeeded = outcome.success,
			"push finished"
		);
		outcome.success > 0
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::time::SystemTime;

	use peer_core::prelude::*;

	use super::*;
	use crate::store::{DeviceRecord, MemoryStore};

	#[derive(Default)]
	struct RecordingChannel {
		pushes: Mutex<Vec<(Vec<Strng>, Command)>>,
	}

	#[async_trait]
	impl WakeChannel for RecordingChannel {
		async fn push(&self, fcm_ids: &[Strng], command: Command) -> anyhow::Result<PushOutcome> {
			self
				.pushes
				.lock()
				.unwrap()
				.push((fcm_ids.to_vec(), command));
			Ok(PushOutcome {
				success: fcm_ids.len(),
				failure: 0,
			})
		}
	}

	fn store_with_devices() -> Arc<MemoryStore> {
		let store = Arc::new(MemoryStore::default());
		for (imei, country) in [("111", "us"), ("222", "us"), ("333", "uk")] {
			store
				.upsert_device(DeviceRecord {
					imei: strng::new(imei),
					fcm_id: strng::format!("fcm-{imei}"),
					asn: strng::new("1"),
					country_code: strng::new(country),
					ip: "10.1.1.1".parse().unwrap(),
					app_version: strng::new("1"),
					last_connect_timestamp: SystemTime::now(),
				})
				.unwrap();
		}
		store
	}

	#[tokio::test]
	async fn wake_by_country_fans_out_and_audits() {
		let store = store_with_devices();
		let channel = Arc::new(RecordingChannel::default());
		let waker = DeviceWaker::new(store.clone(), channel.clone());

		assert!(waker.wake_by_country("us").await);
		let pushes = channel.pushes.lock().unwrap();
		assert_eq!(pushes.len(), 1);
		assert_eq!(pushes[0].0.len(), 2);
		assert_eq!(pushes[0].1, Command::WakeUp);
	}

	#[tokio::test]
	async fn wake_with_no_matching_devices_fails() {
		let store = store_with_devices();
		let channel = Arc::new(RecordingChannel::default());
		let waker = DeviceWaker::new(store, channel.clone());

		assert!(!waker.wake_by_imei("does-not-exist").await);
		assert!(channel.pushes.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn null_channel_reports_failure_but_still_audits() {
		let store = store_with_devices();
		let waker = DeviceWaker::new(store.clone(), Arc::new(NullChannel));
		assert!(!waker.wake_by_imei("111").await);
		// The attempt is still recorded for the audit trail.
		let commands = store.commands().unwrap();
		assert_eq!(commands.len(), 1);
		assert_eq!(commands[0].failure_count, 1);
		assert_eq!(commands[0].success_count, 0);
	}
}
