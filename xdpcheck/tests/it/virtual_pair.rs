use std::time::Duration;

use xdpcheck::{
    generate_default_packets, packets_present, AgentOptions, Deployment, FixtureOverrides,
    HarnessConfig, Orchestrator, OrchestratorOptions,
};

#[tokio::test]
#[ignore = "requires root to create namespaces and veth pairs"]
async fn fixture_crosses_a_virtual_pair() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = HarnessConfig::default_virtual();
    config.clients.truncate(1);

    let Deployment { mut topologies, agents } = config.build(&AgentOptions::default()).unwrap();
    let topology = topologies.get(0).unwrap();
    assert!(topology.namespace().is_some());

    let options = OrchestratorOptions::default().settle(Duration::from_millis(200));
    let mut orchestrator = Orchestrator::raw(options);

    let packets = generate_default_packets(topology, &FixtureOverrides::default()).unwrap();
    let result = orchestrator.send_packets(topology, &packets).await.unwrap();

    assert!(packets_present(&packets, &result.local));
    assert!(result.remote_is_empty());

    drop(agents);
    topologies.teardown().unwrap();
    assert!(topologies.iter().all(|t| t.is_torn_down()));
}
