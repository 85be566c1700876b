#![doc(issue_tracker_base_url = "https://github.com/chainbound/xdpcheck/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Conformance harness for XDP packet filters.
//!
//! The harness loads the filter under test on the *local* interface of a [`Topology`], has the
//! remote side inject deterministic packet fixtures towards it, captures what arrives at every
//! observation point and checks the outcome against what the filter's rules call for.

use std::io;

pub mod agent;
pub mod config;
pub mod filter;
pub mod orchestrator;
pub mod scenario;
pub mod suite;

pub use agent::NamespaceAgent;
pub use config::{Deployment, HarnessConfig, ServerConfig, TopologyConfig};
pub use filter::{
    FilterSession, FilterState, FilterTool, LoadOptions, Policy, Rule, RuleKind, RuleMode, Status,
};
pub use orchestrator::{CaptureResult, Orchestrator, OrchestratorOptions};
pub use scenario::{Device, Scenario};
pub use suite::{Case, CaseContext, CaseOutcome, Check, RunSummary, TestRun, Variant};

pub use xdpcheck_channel::{AgentOptions, CaptureAgent, ChannelOptions, ControlChannel};
pub use xdpcheck_packet::{
    assert_container_empty, assert_packets_in, assert_packets_not_in, generate_default_packets,
    packets_absent, packets_present, AddressFamily, AssertionError, FixtureOverrides, Link,
    MemoryLink, Packet, RawLink,
};
pub use xdpcheck_topo::{
    ChannelDescriptor, Endpoint, EndpointSpec, RemotePoint, Topology, TopologySet, XdpMode,
};
pub use xdpcheck_wire::control::TransportProtocol;

use xdpcheck_channel::ChannelError;
use xdpcheck_topo::command;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(#[source] xdpcheck_topo::Error),
    #[error("control channel unavailable: {0}")]
    ChannelUnavailable(#[source] ChannelError),
    #[error("control channel lost: {0}")]
    ChannelLost(#[source] ChannelError),
    #[error("failed to arm capture on {point}: {reason}")]
    CaptureArmFailed { point: String, reason: String },
    #[error("failed to inject packets on {iface}: {reason}")]
    InjectFailed { iface: String, reason: String },
    #[error("external tool failed\n{0}")]
    ExternalToolFailure(command::Output),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("assertion failed: {0}")]
    Assertion(#[from] AssertionError),
    #[error("packet error: {0}")]
    Packet(#[from] xdpcheck_packet::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<xdpcheck_topo::Error> for HarnessError {
    fn from(e: xdpcheck_topo::Error) -> Self {
        match e {
            xdpcheck_topo::Error::InvalidState(msg) => Self::InvalidState(msg),
            xdpcheck_topo::Error::Command(command::Error::NonZero(output)) => {
                Self::ExternalToolFailure(output)
            }
            other => Self::ResourceUnavailable(other),
        }
    }
}

impl From<ChannelError> for HarnessError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Unavailable { .. } => Self::ChannelUnavailable(e),
            ChannelError::Lost { .. } => Self::ChannelLost(e),
            ChannelError::Remote { .. } | ChannelError::Encode(_) => {
                Self::InvalidState(e.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
