//! Graceful shutdown plumbing.
//!
//! [`new`] returns a connected pair:
//! * [`DrainTrigger`] starts a drain and waits for it to finish.
//! * [`DrainWatcher`] is held (cloned) by every component that should delay
//!   shutdown. A drain completes only after all watchers have dropped their
//!   [`DrainBlocker`].
//!
//! Components that just need a stop signal `select!` on
//! [`DrainWatcher::wait_for_drain`] and drop the returned blocker as they
//! exit.

use tokio::sync::{mpsc, watch};

enum Never {}

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (drained_tx, drained_rx) = mpsc::channel(1);
	(
		DrainTrigger {
			signal_tx,
			drained_rx,
		},
		DrainWatcher {
			drained_tx,
			signal_rx,
		},
	)
}

pub struct DrainTrigger {
	signal_tx: watch::Sender<bool>,
	drained_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
	/// Signal all watchers to stop, then wait until every watcher (and every
	/// outstanding [`DrainBlocker`]) has been dropped.
	pub async fn start_drain_and_wait(mut self) {
		let _ = self.signal_tx.send(true);
		match self.drained_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	drained_tx: mpsc::Sender<Never>,
	signal_rx: watch::Receiver<bool>,
}

impl DrainWatcher {
	/// Completes once a drain has been triggered. The returned blocker must
	/// be dropped to let the drain finish.
	pub async fn wait_for_drain(mut self) -> DrainBlocker {
		// If the trigger was dropped without draining, shut down immediately.
		let _ = self.signal_rx.wait_for(|started| *started).await;
		DrainBlocker(self.drained_tx)
	}
}

#[must_use = "drop the blocker to release the drain"]
pub struct DrainBlocker(mpsc::Sender<Never>);

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = new();
		let second = watcher.clone();
		let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

		tokio::spawn(async move {
			let blocker = watcher.wait_for_drain().await;
			let _ = release_rx.await;
			drop(blocker);
		});
		tokio::spawn(async move {
			let _ = second.wait_for_drain().await;
		});

		let wait = trigger.start_drain_and_wait();
		tokio::pin!(wait);
		tokio::select! {
			_ = &mut wait => panic!("drain completed with a live blocker"),
			_ = tokio::time::sleep(Duration::from_millis(20)) => {},
		}
		release_tx.send(()).unwrap();
		tokio::time::timeout(Duration::from_secs(1), wait)
			.await
			.expect("drain should complete once blockers release");
	}

	#[tokio::test]
	async fn dropped_trigger_unblocks_watchers() {
		let (trigger, watcher) = new();
		drop(trigger);
		let _blocker = tokio::time::timeout(Duration::from_secs(1), watcher.wait_for_drain())
			.await
			.expect("watcher should observe the dropped trigger");
	}
}
