//! Wrapper around the command line tool of the filter under test.
//!
//! The tool is a black box: `load`, `unload`, `status` and the `ether`/`ip`/`port` rule commands,
//! with exit code 0 meaning success.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
};

use xdpcheck_topo::{
    command::{Output, Runner},
    XdpMode,
};
use xdpcheck_wire::control::TransportProtocol;

use crate::{HarnessError, Result};

/// Default action of the filter for packets no rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Packets pass unless a rule matches.
    #[default]
    Allow,
    /// Packets are dropped unless a rule matches.
    Deny,
}

impl Policy {
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Ether,
    Ip,
    Port,
}

impl RuleKind {
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Ether => "ether",
            Self::Ip => "ip",
            Self::Port => "port",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Which side of a packet a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleMode {
    Src,
    Dst,
}

impl RuleMode {
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
        }
    }
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// A filter rule, e.g. `port 60002 --mode dst --proto udp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub kind: RuleKind,
    pub value: String,
    pub mode: RuleMode,
    /// Restricts port rules to one transport protocol.
    pub proto: Option<TransportProtocol>,
}

impl Rule {
    pub fn new(kind: RuleKind, value: impl ToString, mode: RuleMode) -> Self {
        Self { kind, value: value.to_string(), mode, proto: None }
    }

    pub fn proto(mut self, proto: TransportProtocol) -> Self {
        self.proto = Some(proto);
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![self.kind.as_arg().to_owned(), self.value.clone(), "--mode".to_owned()];
        args.push(self.mode.as_arg().to_owned());
        if let Some(proto) = self.proto {
            args.extend(["--proto".to_owned(), proto.as_str().to_owned()]);
        }
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Arguments of `load`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub mode: Option<XdpMode>,
    pub policy: Option<Policy>,
    pub features: Vec<String>,
}

impl LoadOptions {
    pub fn mode(mut self, mode: XdpMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }
}

/// Output of `status`: one line per active rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    lines: Vec<String>,
}

impl Status {
    pub fn parse(stdout: &str) -> Self {
        Self { lines: stdout.lines().filter(|l| !l.trim().is_empty()).map(str::to_owned).collect() }
    }

    /// Whether some line mentions `address`.
    pub fn contains(&self, address: &str) -> bool {
        self.lines.iter().any(|line| line.contains(address))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Runs the filter's executable.
#[derive(Debug, Clone)]
pub struct FilterTool {
    program: PathBuf,
}

impl FilterTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs the tool with `args` and returns its output whatever the exit status.
    pub fn run<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        Ok(Runner::output(&mut cmd).map_err(xdpcheck_topo::Error::from)?)
    }

    /// Like [`FilterTool::run`], failing with [`HarnessError::ExternalToolFailure`] on a non-zero
    /// exit status.
    pub fn run_checked<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.run(args)?;
        if !output.success() {
            return Err(HarnessError::ExternalToolFailure(output));
        }
        Ok(output)
    }

    pub fn load(&self, iface: &str, options: &LoadOptions) -> Result<Output> {
        let mut args = vec!["load".to_owned()];
        if let Some(mode) = options.mode {
            args.extend(["--mode".to_owned(), mode.as_arg().to_owned()]);
        }
        if let Some(policy) = options.policy {
            args.extend(["--policy".to_owned(), policy.as_arg().to_owned()]);
        }
        if !options.features.is_empty() {
            args.extend(["--features".to_owned(), options.features.join(",")]);
        }
        args.push(iface.to_owned());

        self.run(args)
    }

    pub fn unload(&self, iface: &str) -> Result<Output> {
        self.run(["unload", iface])
    }

    /// Unloads the filter from every interface.
    pub fn unload_all(&self) -> Result<Output> {
        self.run(["unload", "--all"])
    }

    pub fn status(&self) -> Result<Status> {
        let output = self.run_checked(["status"])?;
        Ok(Status::parse(&output.stdout))
    }

    pub fn add_rule(&self, rule: &Rule) -> Result<Output> {
        self.run(rule.args())
    }

    /// Removes `rule`. The protocol qualifier plays no part in removal and is not passed.
    pub fn remove_rule(&self, rule: &Rule) -> Result<Output> {
        let rule = Rule { proto: None, ..rule.clone() };
        let mut args = rule.args();
        args.push("--remove".to_owned());
        self.run(args)
    }

    /// Adds `rule` and returns the status printed right after.
    pub fn add_rule_with_status(&self, rule: &Rule) -> Result<Status> {
        let mut args = rule.args();
        args.push("--status".to_owned());
        let output = self.run(args)?;
        Ok(Status::parse(&output.stdout))
    }
}

/// Expected state of the filter on one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Unloaded,
    Loaded { mode: Option<XdpMode>, policy: Policy },
}

/// Drives the filter on one interface, checking every transition against the state the harness
/// expects it to be in.
#[derive(Debug)]
pub struct FilterSession {
    tool: FilterTool,
    iface: String,
    state: FilterState,
}

impl FilterSession {
    pub fn new(tool: FilterTool, iface: impl Into<String>) -> Self {
        Self { tool, iface: iface.into(), state: FilterState::Unloaded }
    }

    #[inline]
    pub fn tool(&self) -> &FilterTool {
        &self.tool
    }

    #[inline]
    pub fn iface(&self) -> &str {
        &self.iface
    }

    #[inline]
    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Loads the filter. Loading an already loaded filter is a state error; use
    /// [`FilterSession::expect_load_fails`] to check the tool rejects it.
    pub fn load(&mut self, options: &LoadOptions) -> Result<()> {
        if self.state != FilterState::Unloaded {
            let msg = format!("filter already loaded on {}", self.iface);
            return Err(HarnessError::InvalidState(msg));
        }

        let output = self.tool.load(&self.iface, options)?;
        if !output.success() {
            return Err(HarnessError::ExternalToolFailure(output));
        }

        let policy = options.policy.unwrap_or_default();
        self.state = FilterState::Loaded { mode: options.mode, policy };
        tracing::debug!(iface = self.iface, state = ?self.state, "filter loaded");
        Ok(())
    }

    pub fn unload(&mut self) -> Result<()> {
        if self.state == FilterState::Unloaded {
            return Err(HarnessError::InvalidState(format!("filter not loaded on {}", self.iface)));
        }

        let output = self.tool.unload(&self.iface)?;
        if !output.success() {
            return Err(HarnessError::ExternalToolFailure(output));
        }

        self.state = FilterState::Unloaded;
        tracing::debug!(iface = self.iface, "filter unloaded");
        Ok(())
    }

    /// Checks that loading is rejected in the current state.
    pub fn expect_load_fails(&self, options: &LoadOptions) -> Result<Output> {
        let output = self.tool.load(&self.iface, options)?;
        expect_failure(output, "load", self.state)
    }

    /// Checks that unloading is rejected in the current state.
    pub fn expect_unload_fails(&self) -> Result<Output> {
        let output = self.tool.unload(&self.iface)?;
        expect_failure(output, "unload", self.state)
    }

    /// Unloads the filter everywhere, ignoring the outcome, and resets the expected state.
    pub fn reset(&mut self) {
        match self.tool.unload_all() {
            Ok(output) if !output.success() => {
                tracing::debug!(code = ?output.code(), "unload --all reported failure")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(?e, "unload --all failed"),
        }
        self.state = FilterState::Unloaded;
    }

    pub fn add_rule(&self, rule: &Rule) -> Result<Output> {
        self.tool.add_rule(rule)
    }

    pub fn add_rule_checked(&self, rule: &Rule) -> Result<()> {
        let output = self.tool.add_rule(rule)?;
        if !output.success() {
            return Err(HarnessError::ExternalToolFailure(output));
        }
        Ok(())
    }

    pub fn remove_rule(&self, rule: &Rule) -> Result<()> {
        let output = self.tool.remove_rule(rule)?;
        if !output.success() {
            return Err(HarnessError::ExternalToolFailure(output));
        }
        Ok(())
    }

    pub fn add_rule_with_status(&self, rule: &Rule) -> Result<Status> {
        self.tool.add_rule_with_status(rule)
    }

    pub fn status(&self) -> Result<Status> {
        self.tool.status()
    }
}

fn expect_failure(output: Output, action: &str, state: FilterState) -> Result<Output> {
    if output.success() {
        let msg = format!("{action} succeeded in state {state:?}\n{output}");
        return Err(HarnessError::InvalidState(msg));
    }
    Ok(output)
}
