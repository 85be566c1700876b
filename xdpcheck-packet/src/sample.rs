//! Evenly spaced addresses across a whole address space, used to fill filter rule tables.

use std::fmt;

pub const DEFAULT_SAMPLE_AMOUNT: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// Dotted IPv4 addresses.
    Ipv4,
    /// Decimal transport ports.
    Port,
    /// Colon separated link addresses.
    Ether,
}

impl AddressFamily {
    /// Width of the address space.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Ipv4 => 32,
            Self::Port => 16,
            Self::Ether => 48,
        }
    }

    /// The rule kind the filter tool uses for this family.
    pub const fn rule_name(self) -> &'static str {
        match self {
            Self::Ipv4 => "ip",
            Self::Port => "port",
            Self::Ether => "ether",
        }
    }

    /// Formats `value` in this family's textual notation.
    pub fn format(self, value: u64) -> String {
        match self {
            Self::Ipv4 => std::net::Ipv4Addr::from(value as u32).to_string(),
            Self::Port => value.to_string(),
            Self::Ether => {
                let bytes = value.to_be_bytes();
                bytes[2..].iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
            }
        }
    }

    /// `amount` distinct values spread evenly over the space, starting at zero.
    ///
    /// The all-ones value is never produced, and `amount` is capped to what the space can hold.
    pub fn sample(self, amount: usize) -> Vec<String> {
        let size = 1u64 << self.bits();
        let max = size - 2;
        let amount = (amount as u64).min(size - 1);
        if amount == 0 {
            return Vec::new();
        }

        let stride = (size / amount).max(1);
        (0..amount).map(|i| self.format((i * stride).min(max))).collect()
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule_name())
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashSet;

    use super::*;

    #[test]
    fn samples_are_distinct_and_spread() {
        for family in [AddressFamily::Ipv4, AddressFamily::Port, AddressFamily::Ether] {
            let values = family.sample(DEFAULT_SAMPLE_AMOUNT);
            assert_eq!(values.len(), DEFAULT_SAMPLE_AMOUNT, "{family}");

            let distinct = values.iter().collect::<FxHashSet<_>>();
            assert_eq!(distinct.len(), values.len(), "{family}");
        }
    }

    #[test]
    fn formats() {
        let ips = AddressFamily::Ipv4.sample(DEFAULT_SAMPLE_AMOUNT);
        assert_eq!(ips[0], "0.0.0.0");
        assert_eq!(ips[1], "0.255.0.255");
        assert_eq!(ips[256], "255.0.255.0");

        let ports = AddressFamily::Port.sample(DEFAULT_SAMPLE_AMOUNT);
        assert_eq!(ports[1], "255");
        assert_eq!(ports[256], "65280");

        assert_eq!(AddressFamily::Ether.format(0x0200_0000_00ff), "02:00:00:00:00:ff");
    }

    #[test]
    fn amount_is_capped_by_the_space() {
        let all = AddressFamily::Port.sample(usize::MAX);
        assert_eq!(all.len(), 65535);
        assert_eq!(all.last().map(String::as_str), Some("65534"));
        assert!(AddressFamily::Port.sample(0).is_empty());
    }
}
