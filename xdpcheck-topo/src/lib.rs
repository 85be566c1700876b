#![doc(issue_tracker_base_url = "https://github.com/chainbound/xdpcheck/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Topology model of the harness.
//!
//! A [`Topology`](topology::Topology) pairs the *local* endpoint, where the filter under test is
//! attached, with a *remote* endpoint that injects traffic and observes leaks. The remote side is
//! either a separate host reached through a capture agent, or a veth peer living in a dedicated
//! network namespace on this machine.

pub mod command;
pub mod endpoint;
pub mod namespace;
pub mod topology;

mod link;

pub use endpoint::{ChannelDescriptor, Endpoint, EndpointSpec, XdpMode};
pub use topology::{RemotePoint, Topology, TopologySet};

use std::io;

/// Maximum length of a Linux interface name (`IFNAMSIZ - 1`).
pub const MAX_IFACE_NAME_LEN: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("command error: {0}")]
    Command(#[from] command::Error),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
    #[error("resource unavailable: {what}: {source}")]
    ResourceUnavailable {
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid interface name {0:?}")]
    InvalidName(String),
}

impl Error {
    pub(crate) fn unavailable(
        what: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ResourceUnavailable { what: what.into(), source: source.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks that `name` is usable as a Linux interface name.
pub fn validate_iface_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFACE_NAME_LEN
        && !name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace());

    if !valid {
        return Err(Error::InvalidName(name.to_owned()));
    }

    Ok(())
}
