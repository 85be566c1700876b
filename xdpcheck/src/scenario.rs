//! The three axes every rule check is run along.

use std::fmt;

use crate::{Policy, RuleMode};

/// Which endpoint's address a rule names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Local,
    Remote,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// A rule check as data: the rule names `device`'s address in `role` position, with the filter
/// loaded under `policy`.
///
/// Fixtures flow from the remote to the local endpoint, so a rule matches them when it names the
/// remote address as source or the local address as destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scenario {
    pub role: RuleMode,
    pub policy: Policy,
    pub device: Device,
}

impl Scenario {
    pub const fn new(role: RuleMode, policy: Policy, device: Device) -> Self {
        Self { role, policy, device }
    }

    /// Whether the rule matches the fixture.
    pub const fn rule_matches(&self) -> bool {
        matches!(
            (self.device, self.role),
            (Device::Remote, RuleMode::Src) | (Device::Local, RuleMode::Dst)
        )
    }

    /// Whether the fixture must reach the local endpoint. Without an active rule only the policy
    /// decides; with one, a matching rule inverts the policy.
    pub const fn expect_delivery(&self, rule_active: bool) -> bool {
        let matched = rule_active && self.rule_matches();
        match self.policy {
            Policy::Allow => !matched,
            Policy::Deny => matched,
        }
    }

    /// Every combination, roles outermost.
    pub fn all() -> Vec<Self> {
        let mut all = Vec::with_capacity(8);
        for role in [RuleMode::Src, RuleMode::Dst] {
            for policy in [Policy::Allow, Policy::Deny] {
                for device in [Device::Local, Device::Remote] {
                    all.push(Self::new(role, policy, device));
                }
            }
        }
        all
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.role, self.policy, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_in_traffic_direction() {
        assert!(Scenario::new(RuleMode::Src, Policy::Allow, Device::Remote).rule_matches());
        assert!(Scenario::new(RuleMode::Dst, Policy::Allow, Device::Local).rule_matches());
        assert!(!Scenario::new(RuleMode::Src, Policy::Allow, Device::Local).rule_matches());
        assert!(!Scenario::new(RuleMode::Dst, Policy::Allow, Device::Remote).rule_matches());
    }

    #[test]
    fn deny_is_the_negation_of_allow() {
        for scenario in Scenario::all() {
            let inverted = Scenario { policy: Policy::Deny, ..scenario };
            let allow = Scenario { policy: Policy::Allow, ..scenario };

            for active in [false, true] {
                let (allowed, denied) =
                    (allow.expect_delivery(active), inverted.expect_delivery(active));
                assert_ne!(allowed, denied, "{scenario}");
            }
        }
    }

    #[test]
    fn no_rule_follows_the_policy() {
        let allow = Scenario::new(RuleMode::Dst, Policy::Allow, Device::Local);
        assert!(allow.expect_delivery(false));
        assert!(!allow.expect_delivery(true));

        let deny = Scenario::new(RuleMode::Src, Policy::Deny, Device::Local);
        assert!(!deny.expect_delivery(false));
        assert!(!deny.expect_delivery(true));
    }

    #[test]
    fn all_is_exhaustive() {
        let all = Scenario::all();
        assert_eq!(all.len(), 8);
        assert_eq!(all.iter().filter(|s| s.rule_matches()).count(), 4);
        assert_eq!(all[0].to_string(), "src/allow/local");
    }
}
