#![doc(issue_tracker_base_url = "https://github.com/chainbound/xdpcheck/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Packets as the harness sees them: deterministic fixtures going in, captures coming out, and
//! the matching rules that decide whether the two agree.

use std::io;

pub mod capture;
pub mod fixture;
pub mod matching;
pub mod sample;

mod packet;
pub use packet::{Fingerprint, NetworkFields, Packet};

pub use capture::{Capture, Link, MemoryLink, RawLink};
pub use fixture::{generate_default_packets, FixtureOverrides};
pub use matching::{
    assert_container_empty, assert_packets_in, assert_packets_not_in, packets_absent,
    packets_present, AssertionError,
};
pub use sample::{AddressFamily, DEFAULT_SAMPLE_AMOUNT};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("topology error: {0}")]
    Topology(#[from] xdpcheck_topo::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing {0} address")]
    MissingAddress(&'static str),
    #[error("failed to build {0} header")]
    Build(&'static str),
    #[error("interface unavailable: {0}")]
    Interface(String),
}

pub type Result<T> = std::result::Result<T, Error>;
