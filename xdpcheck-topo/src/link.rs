//! Virtual Ethernet (veth) plumbing used by virtual topologies.

use std::{net::IpAddr, process::Command};

use crate::{command::Runner, namespace::NetworkNamespace, Result};

pub(crate) const INET_PREFIX_LEN: u8 = 24;
pub(crate) const INET6_PREFIX_LEN: u8 = 64;

/// Create a veth pair `host <-> peer`, with `peer` moved into `namespace`.
///
/// Note: device name length can be max 15 chars long
pub(crate) fn create_veth_pair(host: &str, peer: &str, namespace: &NetworkNamespace) -> Result<()> {
    let mut cmd = Command::new("ip");
    cmd.args(["link", "add", host, "type", "veth", "peer", "name", peer]);
    cmd.args(["netns", namespace.name()]);

    Runner::run(&mut cmd)?;
    Ok(())
}

/// Deletes a link from the host namespace. Deleting one end of a veth pair removes both.
pub(crate) fn delete_link(name: &str) -> Result<()> {
    if !link_exists(name) {
        return Ok(());
    }

    let mut cmd = Command::new("ip");
    cmd.args(["link", "delete", name]);
    Runner::run(&mut cmd)?;
    Ok(())
}

pub(crate) fn link_exists(name: &str) -> bool {
    std::path::Path::new("/sys/class/net").join(name).exists()
}

/// Assigns `address` to `dev` and brings it up, inside `namespace` if given.
pub(crate) fn configure(
    namespace: Option<&NetworkNamespace>,
    dev: &str,
    addresses: &[IpAddr],
) -> Result<()> {
    let ip = || namespace.map_or_else(|| Command::new("ip"), NetworkNamespace::ip);

    for address in addresses {
        let cidr = match address {
            IpAddr::V4(_) => format!("{address}/{INET_PREFIX_LEN}"),
            IpAddr::V6(_) => format!("{address}/{INET6_PREFIX_LEN}"),
        };

        let mut cmd = ip();
        cmd.args(["addr", "add", &cidr, "dev", dev]);
        // No duplicate address detection, the address must be usable right away.
        if address.is_ipv6() {
            cmd.arg("nodad");
        }
        Runner::run(&mut cmd)?;
    }

    let mut cmd = ip();
    cmd.args(["link", "set", "dev", dev, "up"]);
    Runner::run(&mut cmd)?;

    Ok(())
}
