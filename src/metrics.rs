use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("peergateway")
}

#[derive(Debug)]
pub struct Metrics {
	pub agent_enrollments: Counter,
	pub splices_opened: Counter,
	pub splices_closed: Counter,
	pub splices_rejected: Counter,
	pub keepalive_evictions: Counter,
	pub bytes_from_client: Counter,
	pub bytes_from_agent: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let agent_enrollments = Counter::default();
		registry.register(
			"agent_enrollments",
			"Agents that dialed in and were enrolled in the pool",
			agent_enrollments.clone(),
		);
		let splices_opened = Counter::default();
		registry.register(
			"splices_opened",
			"Client connections paired with an agent",
			splices_opened.clone(),
		);
		let splices_closed = Counter::default();
		registry.register(
			"splices_closed",
			"Splices torn down for any reason",
			splices_closed.clone(),
		);
		let splices_rejected = Counter::default();
		registry.register(
			"splices_rejected",
			"Client connections closed because no agent was available",
			splices_rejected.clone(),
		);
		let keepalive_evictions = Counter::default();
		registry.register(
			"keepalive_evictions",
			"Idle agent sockets evicted by the keep-alive sweep",
			keepalive_evictions.clone(),
		);
		let bytes_from_client = Counter::default();
		registry.register(
			"bytes_from_client",
			"Bytes forwarded from external clients to agents",
			bytes_from_client.clone(),
		);
		let bytes_from_agent = Counter::default();
		registry.register(
			"bytes_from_agent",
			"Bytes forwarded from agents to external clients",
			bytes_from_agent.clone(),
		);
		Metrics {
			agent_enrollments,
			splices_opened,
			splices_closed,
			splices_rejected,
			keepalive_evictions,
			bytes_from_client,
			bytes_from_agent,
		}
	}

	/// Standalone instance for tests that do not care about scraping.
	pub fn unregistered() -> Self {
		Metrics::new(&mut Registry::default())
	}
}
