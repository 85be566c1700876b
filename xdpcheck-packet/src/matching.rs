//! Capture-insensitive packet matching.
//!
//! Packets are compared by [`Fingerprint`](crate::Fingerprint) and containers are treated as
//! multisets: order does not matter, duplicates do.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{Fingerprint, Packet};

fn counts(packets: &[Packet]) -> FxHashMap<&Fingerprint, usize> {
    let mut counts = FxHashMap::default();
    for packet in packets {
        *counts.entry(packet.fingerprint()).or_insert(0) += 1;
    }
    counts
}

/// Expected packets that have no counterpart in `observed`, respecting multiplicity.
pub fn missing<'a>(expected: &'a [Packet], observed: &[Packet]) -> Vec<&'a Packet> {
    let mut available = counts(observed);

    expected
        .iter()
        .filter(|packet| match available.get_mut(packet.fingerprint()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .collect()
}

/// Observed packets matching any expected packet.
pub fn matching<'a>(expected: &[Packet], observed: &'a [Packet]) -> Vec<&'a Packet> {
    let expected = expected.iter().map(Packet::fingerprint).collect::<FxHashSet<_>>();
    observed.iter().filter(|packet| expected.contains(packet.fingerprint())).collect()
}

/// Observed packets matching none of the expected packets.
pub fn anomalies<'a>(expected: &[Packet], observed: &'a [Packet]) -> Vec<&'a Packet> {
    let expected = expected.iter().map(Packet::fingerprint).collect::<FxHashSet<_>>();
    observed.iter().filter(|packet| !expected.contains(packet.fingerprint())).collect()
}

/// True if every expected packet, with its multiplicity, was observed.
pub fn packets_present(expected: &[Packet], observed: &[Packet]) -> bool {
    missing(expected, observed).is_empty()
}

/// True if no expected packet was observed.
pub fn packets_absent(expected: &[Packet], observed: &[Packet]) -> bool {
    matching(expected, observed).is_empty()
}

/// A failed packet assertion, with enough context to diagnose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionError {
    pub message: String,
    pub expected: Vec<String>,
    pub observed: Vec<String>,
    /// The packets that made the assertion fail.
    pub offending: Vec<String>,
}

impl AssertionError {
    fn new(
        message: impl Into<String>,
        expected: &[Packet],
        observed: &[Packet],
        offending: Vec<&Packet>,
    ) -> Self {
        Self {
            message: message.into(),
            expected: expected.iter().map(Packet::summary).collect(),
            observed: observed.iter().map(Packet::summary).collect(),
            offending: offending.into_iter().map(Packet::summary).collect(),
        }
    }
}

impl fmt::Display for AssertionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        section(f, "offending", &self.offending)?;
        section(f, "expected", &self.expected)?;
        section(f, "observed", &self.observed)
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str, lines: &[String]) -> fmt::Result {
    writeln!(f, "{title} ({}):", lines.len())?;
    for line in lines {
        writeln!(f, "  {line}")?;
    }
    Ok(())
}

impl std::error::Error for AssertionError {}

/// Fails unless every expected packet was observed.
pub fn assert_packets_in(expected: &[Packet], observed: &[Packet]) -> Result<(), AssertionError> {
    let missing = missing(expected, observed);
    if missing.is_empty() {
        return Ok(());
    }

    let message =
        format!("{} of {} expected packets were not observed", missing.len(), expected.len());
    Err(AssertionError::new(message, expected, observed, missing))
}

/// Fails if any expected packet was observed.
pub fn assert_packets_not_in(
    expected: &[Packet],
    observed: &[Packet],
) -> Result<(), AssertionError> {
    let leaked = matching(expected, observed);
    if leaked.is_empty() {
        return Ok(());
    }

    let message = format!("{} packets were observed that should have been absent", leaked.len());
    Err(AssertionError::new(message, expected, observed, leaked))
}

/// Fails if `observed` holds any packet.
pub fn assert_container_empty(observed: &[Packet]) -> Result<(), AssertionError> {
    if observed.is_empty() {
        return Ok(());
    }

    let message = format!("expected no packets, observed {}", observed.len());
    Err(AssertionError::new(message, &[], observed, observed.iter().collect()))
}
