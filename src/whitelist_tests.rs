use std::collections::HashMap;

use peer_core::prelude::*;

use super::*;

fn mock(entries: HashMap<String, Vec<Ipv4Addr>>, refresh_interval: Duration) -> Arc<WhitelistResolver> {
	WhitelistResolver::with_mock(
		entries.keys().map(strng::new).collect(),
		refresh_interval,
		entries,
	)
}

#[tokio::test]
async fn refresh_populates_the_cache() {
	let resolver = mock(
		HashMap::from([(
			"svc.example.com".to_string(),
			vec!["1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap()],
		)]),
		Duration::from_secs(15),
	);
	assert!(!resolver.subnet_match("1.2.3.4".parse().unwrap()));

	resolver.refresh().await;

	assert!(resolver.subnet_match("1.2.3.4".parse().unwrap()));
	assert!(resolver.subnet_match("5.6.7.8".parse().unwrap()));
	assert!(!resolver.subnet_match("9.9.9.9".parse().unwrap()));
}

#[tokio::test]
async fn subnet_match_compares_first_three_octets() {
	let resolver = mock(
		HashMap::from([(
			"svc.example.com".to_string(),
			vec!["10.20.30.40".parse().unwrap()],
		)]),
		Duration::from_secs(15),
	);
	resolver.refresh().await;

	assert!(resolver.subnet_match("10.20.30.40".parse().unwrap()));
	assert!(resolver.subnet_match("10.20.30.1".parse().unwrap()));
	assert!(!resolver.subnet_match("10.20.31.40".parse().unwrap()));
	assert!(!resolver.subnet_match("11.20.30.40".parse().unwrap()));
}

#[tokio::test]
async fn entries_survive_failed_refreshes_until_expiry() {
	let resolver = mock(
		HashMap::from([(
			"svc.example.com".to_string(),
			vec!["9.8.7.6".parse().unwrap()],
		)]),
		Duration::from_millis(10),
	);
	resolver.refresh().await;
	assert!(resolver.subnet_match("9.8.7.6".parse().unwrap()));

	// The host stops resolving, but the entry only ages out after ten
	// refresh intervals.
	resolver.set_mock_entries(HashMap::new());
	resolver.refresh().await;
	assert!(resolver.subnet_match("9.8.7.6".parse().unwrap()));

	tokio::time::sleep(Duration::from_millis(150)).await;
	resolver.refresh().await;
	assert!(!resolver.subnet_match("9.8.7.6".parse().unwrap()));
}

#[tokio::test]
async fn refreshed_entries_do_not_expire() {
	let resolver = mock(
		HashMap::from([(
			"svc.example.com".to_string(),
			vec!["9.8.7.6".parse().unwrap()],
		)]),
		Duration::from_millis(10),
	);
	resolver.refresh().await;
	tokio::time::sleep(Duration::from_millis(150)).await;
	// Still resolving, so the timestamp moves forward and nothing is pruned.
	resolver.refresh().await;
	assert!(resolver.subnet_match("9.8.7.6".parse().unwrap()));
}
