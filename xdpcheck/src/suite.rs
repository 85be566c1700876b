//! The conformance suite: a list of [`Case`]s run against every topology of a [`TestRun`].

use std::{
    fmt,
    time::{Duration, Instant},
};

use tracing::{info, warn, Instrument};
use xdpcheck_packet::{
    fixture::{DEFAULT_DST_PORT, DEFAULT_SRC_PORT},
    AddressFamily, Link, Packet, RawLink, DEFAULT_SAMPLE_AMOUNT,
};
use xdpcheck_topo::{Endpoint, Topology, TopologySet, XdpMode};

use crate::{
    assert_container_empty, assert_packets_in, assert_packets_not_in, generate_default_packets,
    CaptureResult, Device, FilterSession, FilterTool, FixtureOverrides, HarnessError, LoadOptions,
    Orchestrator, Policy, Result, Rule, RuleKind, RuleMode, Scenario, TransportProtocol,
};

/// Port used by the rule round-trip checks.
const ROUND_TRIP_PORT: u16 = 60002;

/// What a case verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// unload fails, load, unload, unload fails.
    LoadOnce,
    /// unload fails, load, load fails, unload, unload fails.
    LoadTwice,
    /// Without rules the fixture follows the policy.
    PassNone,
    /// A rule naming `device`'s address of `kind` in `role` position.
    Rule { kind: RuleKind, role: RuleMode, device: Device },
    /// A port rule outside of the port range has no effect.
    OutOfRangePort,
    /// An IPv4-mapped IPv6 destination rule applies to the IPv4 destination.
    Ipv4MappedIpv6,
    /// Adding then removing a port rule restores delivery, and the rule leaves the status.
    PortRoundTrip,
    /// A port rule scoped to one protocol leaves the other alone; removing it without the
    /// protocol works.
    ProtocolScopedPort(TransportProtocol),
    /// Adding many rules of one family shows them all in the status.
    ManyStatus(AddressFamily),
    /// Adding many rules of one family: a rule missing from the status still takes effect.
    ManyArrive(AddressFamily),
}

/// How the filter is loaded before a check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Default policy, no explicit mode.
    Plain,
    /// Deny by default, in the local endpoint's mode.
    Inverted,
    /// Default policy, generic mode.
    Skb,
}

impl Variant {
    pub const fn policy(self) -> Policy {
        match self {
            Self::Inverted => Policy::Deny,
            Self::Plain | Self::Skb => Policy::Allow,
        }
    }

    pub fn load_options(self, local: &Endpoint) -> LoadOptions {
        match self {
            Self::Plain => LoadOptions::default(),
            Self::Inverted => LoadOptions::default().policy(Policy::Deny).mode(local.xdp_mode()),
            Self::Skb => LoadOptions::default().mode(XdpMode::Skb),
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Plain => "",
            Self::Inverted => "_inverted",
            Self::Skb => "_skb",
        }
    }
}

/// A named check, with the filter setup it runs under. Cases without a variant drive the filter
/// themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub name: String,
    pub check: Check,
    pub variant: Option<Variant>,
}

impl Case {
    pub fn new(name: impl Into<String>, check: Check, variant: Option<Variant>) -> Self {
        Self { name: name.into(), check, variant }
    }

    /// The full suite, in execution order.
    pub fn defaults() -> Vec<Self> {
        let mut cases = vec![
            Self::new("load_once", Check::LoadOnce, None),
            Self::new("load_twice", Check::LoadTwice, None),
        ];

        let direct = [
            ("pass_none_specified", Check::PassNone),
            ("drop_ip_src", Check::rule(RuleKind::Ip, RuleMode::Src, Device::Remote)),
            ("drop_ip_dst", Check::rule(RuleKind::Ip, RuleMode::Dst, Device::Local)),
            ("drop_port_out_of_range", Check::OutOfRangePort),
            ("drop_ipv4_mapped_ipv6", Check::Ipv4MappedIpv6),
        ];
        for variant in [Variant::Plain, Variant::Skb, Variant::Inverted] {
            for (name, check) in direct {
                cases.push(Self::new(format!("{name}{}", variant.suffix()), check, Some(variant)));
            }
        }

        for kind in [RuleKind::Ether, RuleKind::Port] {
            for scenario in Scenario::all() {
                let variant = match scenario.policy {
                    Policy::Allow => Variant::Plain,
                    Policy::Deny => Variant::Inverted,
                };
                let Scenario { role, device, .. } = scenario;
                let name = format!("{kind}_{role}_{device}{}", variant.suffix());
                let check = Check::rule(kind, role, device);
                cases.push(Self::new(name, check, Some(variant)));
            }
        }

        for variant in [Variant::Plain, Variant::Inverted] {
            let suffix = variant.suffix();
            let check = Check::PortRoundTrip;
            cases.push(Self::new(format!("port_rule_round_trip{suffix}"), check, Some(variant)));

            for protocol in [TransportProtocol::Tcp, TransportProtocol::Udp] {
                let name = format!("protocol_scoped_port_{protocol}{suffix}");
                cases.push(Self::new(name, Check::ProtocolScopedPort(protocol), Some(variant)));
            }
        }

        for variant in [Variant::Plain, Variant::Inverted] {
            let suffix = variant.suffix();
            for family in [AddressFamily::Ipv4, AddressFamily::Port, AddressFamily::Ether] {
                let rule = family.rule_name();
                let status = Self::new(
                    format!("many_{rule}_status{suffix}"),
                    Check::ManyStatus(family),
                    Some(variant),
                );
                let arrive = Self::new(
                    format!("many_{rule}_arrive{suffix}"),
                    Check::ManyArrive(family),
                    Some(variant),
                );
                cases.extend([status, arrive]);
            }
        }

        cases
    }
}

/// Everything a check runs against.
#[derive(Debug)]
pub struct CaseContext<'a, L = RawLink> {
    pub topology: &'a Topology,
    pub orchestrator: &'a mut Orchestrator<L>,
    pub filter: &'a mut FilterSession,
    /// The policy the filter was loaded with.
    pub policy: Policy,
}

impl<L: Link> CaseContext<'_, L> {
    pub fn scenario(&self, role: RuleMode, device: Device) -> Scenario {
        Scenario::new(role, self.policy, device)
    }

    /// Whether fixtures reach the local endpoint, given whether an active rule matches them.
    pub const fn delivered(&self, rule_matches: bool) -> bool {
        match self.policy {
            Policy::Allow => !rule_matches,
            Policy::Deny => rule_matches,
        }
    }

    pub fn fixture(&self, overrides: &FixtureOverrides) -> Result<Vec<Packet>> {
        Ok(generate_default_packets(self.topology, overrides)?)
    }

    /// Sends `packets` and checks they reached the local endpoint if and only if `delivered`.
    /// No remote point may see them either way.
    pub async fn check_delivery(
        &mut self,
        packets: &[Packet],
        delivered: bool,
    ) -> Result<CaptureResult> {
        let result = self.orchestrator.send_packets(self.topology, packets).await?;

        if delivered {
            assert_packets_in(packets, &result.local)?;
        } else {
            assert_packets_not_in(packets, &result.local)?;
        }

        for observed in &result.remote {
            assert_container_empty(observed)?;
        }

        Ok(result)
    }

    fn endpoint(&self, device: Device) -> Result<&Endpoint> {
        Ok(match device {
            Device::Local => self.topology.local()?,
            Device::Remote => self.topology.remote()?,
        })
    }

    /// The value a rule of `kind` uses to name `device`. Ports name the fixture's port on that
    /// side of the link.
    fn rule_value(&self, kind: RuleKind, device: Device) -> Result<String> {
        let endpoint = self.endpoint(device)?;

        Ok(match kind {
            RuleKind::Ether => endpoint.ether().to_string(),
            RuleKind::Ip => endpoint
                .inet()
                .ok_or(xdpcheck_packet::Error::MissingAddress("IPv4"))?
                .to_string(),
            RuleKind::Port => match device {
                Device::Local => DEFAULT_DST_PORT.to_string(),
                Device::Remote => DEFAULT_SRC_PORT.to_string(),
            },
        })
    }
}

impl Check {
    pub const fn rule(kind: RuleKind, role: RuleMode, device: Device) -> Self {
        Self::Rule { kind, role, device }
    }

    pub async fn run<L: Link>(self, ctx: &mut CaseContext<'_, L>) -> Result<()> {
        match self {
            Self::LoadOnce => {
                let options = LoadOptions::default().mode(XdpMode::Skb);
                ctx.filter.expect_unload_fails()?;
                ctx.filter.load(&options)?;
                ctx.filter.unload()?;
                ctx.filter.expect_unload_fails()?;
            }
            Self::LoadTwice => {
                let options = LoadOptions::default().mode(XdpMode::Skb);
                ctx.filter.expect_unload_fails()?;
                ctx.filter.load(&options)?;
                ctx.filter.expect_load_fails(&options)?;
                ctx.filter.unload()?;
                ctx.filter.expect_unload_fails()?;
            }
            Self::PassNone => {
                let packets = ctx.fixture(&FixtureOverrides::default())?;
                ctx.check_delivery(&packets, ctx.delivered(false)).await?;
            }
            Self::Rule { kind, role, device } => {
                let rule = Rule::new(kind, ctx.rule_value(kind, device)?, role);
                let scenario = ctx.scenario(role, device);
                ctx.filter.add_rule_checked(&rule)?;

                let packets = ctx.fixture(&FixtureOverrides::default())?;
                ctx.check_delivery(&packets, scenario.expect_delivery(true)).await?;
            }
            Self::OutOfRangePort => {
                let rule = Rule::new(RuleKind::Port, 1u32 << 16, RuleMode::Src);
                let output = ctx.filter.add_rule(&rule)?;
                tracing::debug!(code = ?output.code(), "out of range port rule");

                let packets = ctx.fixture(&FixtureOverrides::default())?;
                ctx.check_delivery(&packets, ctx.delivered(false)).await?;
            }
            Self::Ipv4MappedIpv6 => {
                let local = ctx.rule_value(RuleKind::Ip, Device::Local)?;
                let rule = Rule::new(RuleKind::Ip, format!("::ffff:{local}"), RuleMode::Dst);
                let output = ctx.filter.add_rule(&rule)?;
                tracing::debug!(code = ?output.code(), "mapped address rule");

                let packets = ctx.fixture(&FixtureOverrides::default())?;
                ctx.check_delivery(&packets, ctx.delivered(true)).await?;
            }
            Self::PortRoundTrip => {
                let packets = ctx.fixture(&FixtureOverrides::default().dst_port(ROUND_TRIP_PORT))?;
                let rule = Rule::new(RuleKind::Port, ROUND_TRIP_PORT, RuleMode::Dst);

                ctx.check_delivery(&packets, ctx.delivered(false)).await?;
                ctx.filter.add_rule_checked(&rule)?;
                ctx.check_delivery(&packets, ctx.delivered(true)).await?;
                ctx.filter.remove_rule(&rule)?;

                if ctx.filter.status()?.contains(&ROUND_TRIP_PORT.to_string()) {
                    return Err(HarnessError::InvalidState(format!(
                        "status lists port {ROUND_TRIP_PORT} after removal"
                    )));
                }
                ctx.check_delivery(&packets, ctx.delivered(false)).await?;
            }
            Self::ProtocolScopedPort(scoped) => {
                let other = match scoped {
                    TransportProtocol::Tcp => TransportProtocol::Udp,
                    TransportProtocol::Udp => TransportProtocol::Tcp,
                };
                let overrides = FixtureOverrides::default().dst_port(ROUND_TRIP_PORT);
                let unscoped = ctx.fixture(&overrides.clone().protocol(other))?;
                let scoped_packets = ctx.fixture(&overrides.protocol(scoped))?;
                let rule = Rule::new(RuleKind::Port, ROUND_TRIP_PORT, RuleMode::Dst).proto(scoped);

                ctx.filter.add_rule_checked(&rule)?;
                ctx.check_delivery(&unscoped, ctx.delivered(false)).await?;
                ctx.check_delivery(&scoped_packets, ctx.delivered(true)).await?;

                ctx.filter.remove_rule(&rule)?;
                ctx.check_delivery(&scoped_packets, ctx.delivered(false)).await?;
            }
            Self::ManyStatus(family) => {
                let added = fill_rule_table(ctx, family)?;
                let status = ctx.filter.status()?;
                if status.len() < added.addresses.len() {
                    return Err(HarnessError::InvalidState(format!(
                        "status lists {} rules after adding {} {family} rules",
                        status.len(),
                        added.addresses.len()
                    )));
                }
            }
            Self::ManyArrive(family) => {
                let added = fill_rule_table(ctx, family)?;
                let Some(missing) = added.missing_from_status.first() else {
                    return Ok(());
                };

                let overrides = FixtureOverrides::default().dst_address(family, missing)?;
                let packets = ctx.fixture(&overrides)?;
                ctx.check_delivery(&packets, ctx.delivered(true)).await?;
            }
        }

        Ok(())
    }
}

fn rule_kind(family: AddressFamily) -> RuleKind {
    match family {
        AddressFamily::Ipv4 => RuleKind::Ip,
        AddressFamily::Port => RuleKind::Port,
        AddressFamily::Ether => RuleKind::Ether,
    }
}

/// Destination rules added by [`fill_rule_table`].
struct FilledTable {
    addresses: Vec<String>,
    /// Addresses whose rule did not grow the status.
    missing_from_status: Vec<String>,
}

/// Adds a destination rule for every sampled address of `family`.
fn fill_rule_table<L: Link>(
    ctx: &CaseContext<'_, L>,
    family: AddressFamily,
) -> Result<FilledTable> {
    let addresses = family.sample(DEFAULT_SAMPLE_AMOUNT);
    let mut last = ctx.filter.status()?.len();
    let mut missing_from_status = Vec::new();

    for address in &addresses {
        let rule = Rule::new(rule_kind(family), address, RuleMode::Dst);
        let status = ctx.filter.add_rule_with_status(&rule)?;
        if status.len() == last {
            missing_from_status.push(address.clone());
        }
        last = status.len();
    }

    if !missing_from_status.is_empty() {
        warn!(%family, missing = ?missing_from_status, "rules missing from the status");
    }

    Ok(FilledTable { addresses, missing_from_status })
}

/// Outcome of one case on one topology.
#[derive(Debug)]
pub struct CaseOutcome {
    pub case: String,
    pub topology: String,
    pub elapsed: Duration,
    pub result: Result<()>,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<CaseOutcome>,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(CaseOutcome::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            let status = if outcome.passed() { "ok  " } else { "FAIL" };
            writeln!(f, "{status} {} {} ({:?})", outcome.topology, outcome.case, outcome.elapsed)?;
            if let Err(e) = &outcome.result {
                for line in e.to_string().lines() {
                    writeln!(f, "       {line}")?;
                }
            }
        }

        let failed = self.failures().count();
        write!(f, "{} passed, {failed} failed", self.outcomes.len() - failed)
    }
}

/// Runs cases against every topology of a set. The topology under test is passed to every case
/// through its [`CaseContext`].
#[derive(Debug)]
pub struct TestRun<L = RawLink> {
    topologies: TopologySet,
    orchestrator: Orchestrator<L>,
    tool: FilterTool,
    cases: Vec<Case>,
}

impl<L: Link> TestRun<L> {
    pub fn new(topologies: TopologySet, orchestrator: Orchestrator<L>, tool: FilterTool) -> Self {
        Self { topologies, orchestrator, tool, cases: Case::defaults() }
    }

    /// Keeps the cases whose name contains `pattern`.
    pub fn filter_cases(mut self, pattern: &str) -> Self {
        self.cases.retain(|case| case.name.contains(pattern));
        self
    }

    pub fn cases(&self) -> &[Case] {
        &self.cases
    }

    pub fn topologies(&self) -> &TopologySet {
        &self.topologies
    }

    /// Runs every case on every topology, in order. The filter is unloaded from every interface
    /// after each case, whatever its outcome.
    pub async fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();

        for topology in self.topologies.iter() {
            let iface = match topology.local() {
                Ok(local) => local.iface().to_owned(),
                Err(e) => {
                    warn!(topology = topology.name(), ?e, "skipping topology");
                    continue;
                }
            };
            let mut filter = FilterSession::new(self.tool.clone(), iface);
            filter.reset();

            for case in &self.cases {
                let span =
                    tracing::info_span!("case", case = case.name, topology = topology.name());
                let start = Instant::now();

                let result = run_case(case, topology, &mut self.orchestrator, &mut filter)
                    .instrument(span.clone())
                    .await;
                filter.reset();

                let elapsed = start.elapsed();
                span.in_scope(|| match &result {
                    Ok(()) => info!(?elapsed, "case passed"),
                    Err(e) => warn!(?elapsed, error = %e, "case failed"),
                });

                summary.outcomes.push(CaseOutcome {
                    case: case.name.clone(),
                    topology: topology.name().to_owned(),
                    elapsed,
                    result,
                });
            }
        }

        summary
    }

    /// Tears down every topology of the run.
    pub fn teardown(&mut self) -> Result<()> {
        Ok(self.topologies.teardown()?)
    }
}

async fn run_case<L: Link>(
    case: &Case,
    topology: &Topology,
    orchestrator: &mut Orchestrator<L>,
    filter: &mut FilterSession,
) -> Result<()> {
    let policy = case.variant.map_or(Policy::Allow, Variant::policy);
    if let Some(variant) = case.variant {
        filter.load(&variant.load_options(topology.local()?))?;
    }

    let mut ctx = CaseContext { topology, orchestrator, filter, policy };
    case.check.run(&mut ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cases_have_unique_names() {
        let cases = Case::defaults();
        let mut names = cases.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), cases.len());

        for name in ["load_once", "drop_ip_dst_inverted", "drop_port_out_of_range_skb"] {
            assert!(names.contains(&name), "{name}");
        }
        assert!(names.contains(&"port_dst_local_inverted"));

        for family in ["ip", "port", "ether"] {
            for check in ["status", "arrive"] {
                for suffix in ["", "_inverted"] {
                    let name = format!("many_{family}_{check}{suffix}");
                    assert!(names.contains(&name.as_str()), "{name}");
                }
            }
        }
        for name in ["protocol_scoped_port_tcp", "protocol_scoped_port_udp_inverted"] {
            assert!(names.contains(&name), "{name}");
        }
    }

    #[test]
    fn variants_set_up_the_filter() {
        use pnet::util::MacAddr;
        use xdpcheck_topo::EndpointSpec;

        let local = EndpointSpec::new("a_to_b")
            .ether(MacAddr::new(2, 0, 0, 0, 0, 1))
            .xdp_mode(XdpMode::Native)
            .build()
            .unwrap();

        assert_eq!(Variant::Plain.load_options(&local), LoadOptions::default());
        assert_eq!(Variant::Skb.load_options(&local), LoadOptions::default().mode(XdpMode::Skb));
        assert_eq!(
            Variant::Inverted.load_options(&local),
            LoadOptions::default().policy(Policy::Deny).mode(XdpMode::Native)
        );
        assert_eq!(Variant::Inverted.policy(), Policy::Deny);
    }

    #[test]
    fn summary_reports_failures() {
        let summary = RunSummary {
            outcomes: vec![
                CaseOutcome {
                    case: "load_once".into(),
                    topology: "a_to_b".into(),
                    elapsed: Duration::from_millis(3),
                    result: Ok(()),
                },
                CaseOutcome {
                    case: "drop_ip_src".into(),
                    topology: "a_to_b".into(),
                    elapsed: Duration::from_millis(3),
                    result: Err(HarnessError::InvalidState("boom".into())),
                },
            ],
        };

        assert!(!summary.passed());
        let rendered = summary.to_string();
        assert!(rendered.contains("FAIL a_to_b drop_ip_src"));
        assert!(rendered.contains("invalid state: boom"));
        assert!(rendered.ends_with("1 passed, 1 failed"));
    }
}
