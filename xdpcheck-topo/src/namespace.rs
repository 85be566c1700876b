use std::{
    future::Future,
    io,
    os::fd::AsFd,
    path::{Path, PathBuf},
    process::Command,
};

use nix::sched::CloneFlags;

use crate::{command::Runner, Error, Result};

#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
    #[error("task error: {0}")]
    Task(E),
}

/// A named Linux network namespace, as managed by `ip netns`.
#[derive(Debug)]
pub struct NetworkNamespace {
    name: String,
}

impl NetworkNamespace {
    pub fn path(name: &str) -> PathBuf {
        Path::new("/run").join("netns").join(name)
    }

    /// A handle on the namespace `name`, without creating it.
    #[cfg(test)]
    pub(crate) fn detached(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Creates the network namespace `name`.
    pub fn create(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        let mut cmd = Command::new("ip");
        cmd.args(["netns", "add", &name]);
        tracing::debug!(namespace = name, "creating namespace");

        Runner::run(&mut cmd).map_err(|e| Error::unavailable(format!("namespace {name}"), e))?;

        Ok(Self { name })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds an `ip` command that executes inside this namespace.
    pub fn ip(&self) -> Command {
        let mut cmd = Command::new("ip");
        cmd.args(["-n", &self.name]);
        cmd
    }

    /// Deletes the namespace. Deleting a namespace that is already gone is not an error.
    pub fn delete(&self) -> Result<()> {
        if !Self::path(&self.name).exists() {
            return Ok(());
        }

        let mut cmd = Command::new("ip");
        cmd.args(["netns", "delete", &self.name]);
        tracing::debug!(namespace = self.name, "deleting namespace");

        Runner::run(&mut cmd)?;
        Ok(())
    }

    /// Runs the provided future in this network namespace. Running code on a different namespace
    /// requires spawning a dedicated OS thread, which will create its own asynchronous runtime.
    /// Threads and sockets created by the task stay in the namespace.
    pub fn run<T, E, F>(
        &self,
        task: F,
    ) -> Result<std::thread::JoinHandle<std::result::Result<T, TaskError<E>>>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let file = std::fs::File::open(Self::path(&self.name))?;
        let name = self.name.clone();

        let handle = std::thread::Builder::new().name(format!("netns-{name}")).spawn(move || {
            let flags = CloneFlags::from_bits_truncate(nix::libc::CLONE_NEWNET);
            let fd = file.as_fd();

            tracing::debug!(?fd, namespace = name, "setting namespace for thread");

            nix::sched::setns(fd, flags)?;

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            let _span = tracing::info_span!("namespace job", namespace = name).entered();
            rt.block_on(task).map_err(TaskError::Task)
        })?;

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_command_targets_namespace() {
        let ns = NetworkNamespace { name: "test_b".to_string() };
        let mut cmd = ns.ip();
        cmd.args(["link", "set", "dev", "lo", "up"]);

        assert_eq!(crate::command::display(&cmd), "ip -n test_b link set dev lo up");
        assert_eq!(NetworkNamespace::path("test_b"), PathBuf::from("/run/netns/test_b"));
    }

    #[test]
    fn deleting_a_missing_namespace_is_a_no_op() {
        let ns = NetworkNamespace { name: "xdpcheck-never-created".to_string() };
        assert!(ns.delete().is_ok());
        assert!(ns.delete().is_ok());
    }
}
