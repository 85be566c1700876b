use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use pnet::util::MacAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xdpcheck::{
    AgentOptions, CaptureAgent, ChannelDescriptor, Deployment, EndpointSpec, FilterTool,
    HarnessConfig, HarnessError, Orchestrator, OrchestratorOptions, RawLink, TestRun,
    TopologyConfig, XdpMode,
};

#[derive(Debug, Parser)]
#[command(name = "xdpcheck", version, about = "Conformance harness for XDP packet filters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve capture and inject requests for the interfaces of this host.
    Agent {
        #[arg(long, default_value = "0.0.0.0:6555")]
        listen: SocketAddr,
        /// Delay between two injected frames, in milliseconds.
        #[arg(long, default_value_t = 1)]
        inject_gap_ms: u64,
    },
    /// Run the conformance suite.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// The filter's command line tool.
    #[arg(long, default_value = "progs/xdp-filter-exec.sh")]
    filter_exec: PathBuf,
    /// Create the default virtual pairs instead of using a remote host.
    #[arg(long = "virtual")]
    use_virtual: bool,
    #[arg(long, required_unless_present = "use_virtual")]
    local_iface: Option<String>,
    #[arg(long)]
    local_inet: Option<Ipv4Addr>,
    #[arg(long, default_value = "skb")]
    xdp_mode: XdpMode,
    #[arg(long, required_unless_present = "use_virtual")]
    remote_iface: Option<String>,
    #[arg(long, value_parser = parse_mac, required_unless_present = "use_virtual")]
    remote_ether: Option<MacAddr>,
    #[arg(long)]
    remote_inet: Option<Ipv4Addr>,
    /// Address of the agent on the remote host.
    #[arg(long, default_value = "192.168.0.106:6555")]
    channel: SocketAddr,
    /// Only run the cases whose name contains this pattern.
    #[arg(long)]
    case: Option<String>,
    /// Wait between sending a fixture and collecting it, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    settle_ms: u64,
}

fn parse_mac(s: &str) -> Result<MacAddr, String> {
    s.parse().map_err(|e| format!("invalid link address {s}: {e:?}"))
}

impl RunArgs {
    fn harness_config(&self) -> HarnessConfig {
        let mut config = HarnessConfig::default_virtual();
        if self.use_virtual {
            return config;
        }

        let mut local =
            EndpointSpec::new(self.local_iface.clone().unwrap_or_default()).xdp_mode(self.xdp_mode);
        if let Some(inet) = self.local_inet {
            local = local.inet(inet);
        }

        let mut remote = EndpointSpec::new(self.remote_iface.clone().unwrap_or_default());
        if let Some(ether) = self.remote_ether {
            remote = remote.ether(ether);
        }
        if let Some(inet) = self.remote_inet {
            remote = remote.inet(inet);
        }

        let channel = ChannelDescriptor::from(self.channel);
        config.clients = vec![TopologyConfig::Remote { local, remote, channel }];
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Agent { listen, inject_gap_ms } => {
            agent(listen, Duration::from_millis(inject_gap_ms)).await
        }
        Command::Run(args) => run(args).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(?e, "xdpcheck failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn agent(listen: SocketAddr, inject_gap: Duration) -> Result<bool, HarnessError> {
    let options = AgentOptions::default().inject_gap(inject_gap);
    let agent = CaptureAgent::bind(listen, RawLink::default(), options)
        .await
        .map_err(|e| {
            HarnessError::InvalidState(format!("failed to start agent on {listen}: {e}"))
        })?;

    agent
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| HarnessError::InvalidState(format!("agent failed: {e}")))?;

    Ok(true)
}

async fn run(args: RunArgs) -> Result<bool, HarnessError> {
    let config = args.harness_config();
    let Deployment { topologies, agents } = config.build(&AgentOptions::default())?;
    info!(topologies = topologies.len(), agents = agents.len(), "topologies ready");

    let options = OrchestratorOptions::default().settle(Duration::from_millis(args.settle_ms));
    let tool = FilterTool::new(&args.filter_exec);
    let mut run = TestRun::new(topologies, Orchestrator::raw(options), tool);
    if let Some(pattern) = &args.case {
        run = run.filter_cases(pattern);
    }

    let summary = run.run().await;
    println!("{summary}");

    drop(agents);
    run.teardown()?;

    Ok(summary.passed())
}
