use std::{net::Ipv4Addr, time::Duration};

use pnet::util::MacAddr;
use xdpcheck::{
    AgentOptions, Case, CaptureAgent, EndpointSpec, FilterTool, HarnessError, MemoryLink,
    Orchestrator, OrchestratorOptions, TestRun, Topology, TopologySet,
};

use crate::reference;

fn options() -> OrchestratorOptions {
    OrchestratorOptions::default()
        .settle(Duration::from_millis(10))
        .collect_timeout(Duration::from_millis(100))
}

/// A memory link `a_to_b <-> b_to_a` with an agent serving it, and the matching topology.
async fn setup(link: &MemoryLink) -> TopologySet {
    link.connect("a_to_b", "b_to_a");

    let options = AgentOptions::default().inject_gap(Duration::ZERO);
    let agent = CaptureAgent::bind("127.0.0.1:0", link.clone(), options).await.unwrap();
    let addr = agent.local_addr().unwrap();
    tokio::spawn(agent.run());

    let local = EndpointSpec::new("a_to_b")
        .ether(MacAddr::new(0x02, 0, 0, 0, 0xb, 1))
        .inet(Ipv4Addr::new(192, 168, 3, 1))
        .build()
        .unwrap();
    let remote = EndpointSpec::new("b_to_a")
        .ether(MacAddr::new(0x02, 0, 0, 0, 0xb, 2))
        .inet(Ipv4Addr::new(192, 168, 3, 2))
        .build()
        .unwrap();

    [Topology::new_remote(local, remote, addr.into()).unwrap()].into_iter().collect()
}

#[tokio::test]
async fn suite_passes_against_the_reference_filter() {
    let _ = tracing_subscriber::fmt::try_init();

    let (tool, dir) = reference::tool("suite");
    let link = MemoryLink::new();
    let topologies = setup(&link).await;
    link.set_ingress_filter("a_to_b", reference::ingress(dir.clone()));

    let mut run = TestRun::new(topologies, Orchestrator::new(link, options()), tool);
    let summary = run.run().await;

    assert!(summary.passed(), "{summary}");
    assert_eq!(summary.outcomes.len(), Case::defaults().len());
    run.teardown().unwrap();

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn ignored_rules_are_caught() {
    let _ = tracing_subscriber::fmt::try_init();

    // The tool accepts rules, but nothing enforces them.
    let (tool, dir) = reference::tool("ignored-rules");
    let link = MemoryLink::new();
    let topologies = setup(&link).await;

    let orchestrator = Orchestrator::new(link, options());
    let mut run = TestRun::new(topologies, orchestrator, tool).filter_cases("drop_ip_dst");
    assert_eq!(run.cases().len(), 3);

    let summary = run.run().await;
    let failures = summary.failures().map(|o| o.case.as_str()).collect::<Vec<_>>();
    assert_eq!(failures, ["drop_ip_dst", "drop_ip_dst_skb"], "{summary}");
    assert!(summary.failures().all(|o| matches!(o.result, Err(HarnessError::Assertion(_)))));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn load_state_machine_violations_are_caught() {
    let _ = tracing_subscriber::fmt::try_init();

    // Succeeds at everything, including unloading what was never loaded.
    let tool = FilterTool::new("true");
    let link = MemoryLink::new();
    let topologies = setup(&link).await;

    let orchestrator = Orchestrator::new(link, options());
    let mut run = TestRun::new(topologies, orchestrator, tool).filter_cases("load_");
    let summary = run.run().await;

    assert_eq!(summary.outcomes.len(), 2);
    assert!(
        summary.outcomes.iter().all(|o| matches!(o.result, Err(HarnessError::InvalidState(_)))),
        "{summary}"
    );
}

#[tokio::test]
async fn rules_missing_from_the_status_must_still_apply() {
    let _ = tracing_subscriber::fmt::try_init();

    for hide in [false, true] {
        let (tool, dir) = reference::tool(if hide { "hidden-rules" } else { "dropped-rules" });
        reference::limit_rules(&dir, 100, hide);
        let link = MemoryLink::new();
        let topologies = setup(&link).await;
        link.set_ingress_filter("a_to_b", reference::ingress(dir.clone()));

        let orchestrator = Orchestrator::new(link, options());
        let mut run = TestRun::new(topologies, orchestrator, tool).filter_cases("many_port_");
        assert_eq!(run.cases().len(), 4);

        let summary = run.run().await;
        let mut failures = summary.failures().map(|o| o.case.as_str()).collect::<Vec<_>>();
        failures.sort_unstable();

        if hide {
            // Enforced but unlisted: only the status checks notice.
            assert_eq!(failures, ["many_port_status", "many_port_status_inverted"], "{summary}");
        } else {
            let expected = [
                "many_port_arrive",
                "many_port_arrive_inverted",
                "many_port_status",
                "many_port_status_inverted",
            ];
            assert_eq!(failures, expected, "{summary}");
            let mut arrive = summary.failures().filter(|o| o.case.contains("arrive"));
            assert!(arrive.all(|o| matches!(o.result, Err(HarnessError::Assertion(_)))));
        }

        let _ = std::fs::remove_dir_all(dir);
    }
}

#[tokio::test]
async fn protocol_scoped_rules_are_checked_both_ways() {
    let _ = tracing_subscriber::fmt::try_init();

    let (tool, dir) = reference::tool("protocol-scoped");
    let link = MemoryLink::new();
    let topologies = setup(&link).await;
    link.set_ingress_filter("a_to_b", reference::ingress(dir.clone()));

    let orchestrator = Orchestrator::new(link, options());
    let mut run = TestRun::new(topologies, orchestrator, tool).filter_cases("protocol_scoped_port");
    let names = run.cases().iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        [
            "protocol_scoped_port_tcp",
            "protocol_scoped_port_udp",
            "protocol_scoped_port_tcp_inverted",
            "protocol_scoped_port_udp_inverted",
        ]
    );

    let summary = run.run().await;
    assert!(summary.passed(), "{summary}");

    let _ = std::fs::remove_dir_all(dir);
}
