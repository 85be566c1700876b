//! A reference filter: a shell stand-in for the filter's tool keeping its rules in files, and a
//! [`MemoryLink`] ingress filter enforcing them.
//!
//! A `capacity` file in the tool's directory bounds the rules listed by `status`. Rules past it
//! are dropped, or kept out of the status but still enforced when a `hide` file exists.

use std::{
    fs,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use pnet::util::MacAddr;
use xdpcheck::FilterTool;
use xdpcheck_packet::{capture::IngressFilter, Fingerprint};

const TOOL: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
cmd="$1"
[ $# -gt 0 ] && shift
case "$cmd" in
load)
    [ -e "$dir/loaded" ] && { echo "already loaded" >&2; exit 1; }
    policy=allow
    while [ $# -gt 0 ]; do
        case "$1" in
        --policy) policy="$2"; shift 2 ;;
        --mode|--features) shift 2 ;;
        *) shift ;;
        esac
    done
    echo "$policy" > "$dir/loaded"
    : > "$dir/rules"
    : > "$dir/hidden"
    ;;
unload)
    if [ "$1" = "--all" ]; then
        rm -f "$dir/loaded" "$dir/rules" "$dir/hidden"
        exit 0
    fi
    [ -e "$dir/loaded" ] || { echo "not loaded" >&2; exit 1; }
    rm -f "$dir/loaded" "$dir/rules" "$dir/hidden"
    ;;
status)
    [ -e "$dir/rules" ] && cat "$dir/rules"
    exit 0
    ;;
ip|ether|port)
    value="$1"; shift
    mode=; proto=; remove=0; status=0
    while [ $# -gt 0 ]; do
        case "$1" in
        --mode) mode="$2"; shift 2 ;;
        --proto) proto="$2"; shift 2 ;;
        --remove) remove=1; shift ;;
        --status) status=1; shift ;;
        *) exit 2 ;;
        esac
    done
    if [ "$cmd" = port ] && [ "$value" -gt 65535 ]; then
        echo "port out of range" >&2
        exit 1
    fi
    touch "$dir/rules"
    if [ "$remove" = 1 ]; then
        grep -v "^$cmd $value $mode" "$dir/rules" > "$dir/rules.tmp"
        mv "$dir/rules.tmp" "$dir/rules"
    elif [ -e "$dir/capacity" ] && [ "$(wc -l < "$dir/rules")" -ge "$(cat "$dir/capacity")" ]; then
        [ -e "$dir/hide" ] && echo "$cmd $value $mode $proto" >> "$dir/hidden"
    else
        echo "$cmd $value $mode $proto" >> "$dir/rules"
    fi
    [ "$status" = 1 ] && cat "$dir/rules"
    exit 0
    ;;
*)
    exit 2
    ;;
esac
"#;

/// A fresh directory holding the tool and its state.
pub fn tool(name: &str) -> (FilterTool, PathBuf) {
    let dir = std::env::temp_dir().join(format!("xdpcheck-it-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();

    let path = dir.join("xdp-filter-exec.sh");
    fs::write(&path, TOOL).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    (FilterTool::new(path), dir)
}

/// Limits the status to `capacity` rules. With `hide`, rules past it are still enforced.
pub fn limit_rules(dir: &Path, capacity: usize, hide: bool) {
    fs::write(dir.join("capacity"), capacity.to_string()).unwrap();
    if hide {
        fs::write(dir.join("hide"), "").unwrap();
    }
}

/// Accepts or drops frames the way the filter would, given the state kept by the tool in `dir`.
pub fn ingress(dir: PathBuf) -> IngressFilter {
    Box::new(move |frame| accepts(&dir, frame))
}

fn accepts(dir: &Path, frame: &[u8]) -> bool {
    let Ok(policy) = fs::read_to_string(dir.join("loaded")) else {
        return true;
    };
    let Ok(fp) = Fingerprint::parse(&Bytes::copy_from_slice(frame)) else {
        return true;
    };

    let mut rules = fs::read_to_string(dir.join("rules")).unwrap_or_default();
    rules.push_str(&fs::read_to_string(dir.join("hidden")).unwrap_or_default());
    let matched = rules.lines().any(|line| rule_matches(line, &fp));

    match policy.trim() {
        "deny" => matched,
        _ => !matched,
    }
}

fn rule_matches(line: &str, fp: &Fingerprint) -> bool {
    let mut words = line.split_whitespace();
    let (Some(kind), Some(value), Some(mode)) = (words.next(), words.next(), words.next()) else {
        return false;
    };
    let proto = words.next();
    let src = mode == "src";

    match kind {
        "ip" => {
            let Ok(addr) = value.parse::<IpAddr>() else { return false };
            let addr = match addr {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
                v4 => v4,
            };
            let observed = if src { fp.src_ip() } else { fp.dst_ip() };
            observed == Some(addr)
        }
        "ether" => {
            let Ok(mac) = value.parse::<MacAddr>() else { return false };
            if src {
                fp.ether_src == mac
            } else {
                fp.ether_dst == mac
            }
        }
        "port" => {
            let Ok(port) = value.parse::<u16>() else { return false };
            let protocol = match proto {
                Some("tcp") => Some(6),
                Some("udp") => Some(17),
                _ => None,
            };
            if protocol.is_some() && protocol != fp.protocol() {
                return false;
            }
            fp.ports.is_some_and(|(s, d)| if src { s == port } else { d == port })
        }
        _ => false,
    }
}
