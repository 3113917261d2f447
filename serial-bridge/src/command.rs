use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::debug;

use crate::config::{BridgeConfig, is_wildcard_host};

/// A socat invocation derived from a [`BridgeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl BridgeCommand {
    pub fn new(program: impl Into<PathBuf>, config: &BridgeConfig, device: &Path) -> Self {
        Self {
            program: program.into(),
            args: build_args(config, device),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Shell-escaped command line, for display and logs.
    pub fn render(&self) -> String {
        std::iter::once(self.program.to_string_lossy())
            .chain(self.args.iter().map(|arg| arg.as_str().into()))
            .map(shell_escape::escape)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build the tokio command with piped output.
    ///
    /// The child leads its own process group so that signals reach the
    /// connection handlers socat forks.
    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        debug!("Bridge command: {}", self.render());
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }
}

/// Compute socat arguments:
/// `[-d..] [-v] [-x] [-b N] <extra> TCP-LISTEN:<port>[,opts] <device>[,opts]`.
pub fn build_args(config: &BridgeConfig, device: &Path) -> Vec<String> {
    let mut args = Vec::new();

    for _ in 0..config.debug_level {
        args.push("-d".to_string());
    }
    if config.verbose {
        args.push("-v".to_string());
    }
    if config.hex_dump {
        args.push("-x".to_string());
    }
    if let Some(block_size) = config.block_size {
        args.push("-b".to_string());
        args.push(block_size.to_string());
    }
    args.extend(config.extra_flags.iter().cloned());

    let mut tcp = vec![format!("TCP-LISTEN:{}", config.tcp_port)];
    if !is_wildcard_host(&config.tcp_host) {
        tcp.push(format!("bind={}", config.tcp_host.trim()));
    }
    if config.allow_fork {
        tcp.push("fork".to_string());
    }
    if config.reuse_address {
        tcp.push("reuseaddr".to_string());
    }
    tcp.extend(config.tcp_options.iter().cloned());
    args.push(tcp.join(","));

    let mut serial = vec![device.to_string_lossy().into_owned()];
    if config.raw_mode {
        serial.push("raw".to_string());
    }
    if config.no_echo {
        serial.push("echo=0".to_string());
    }
    serial.extend(config.serial_options.iter().cloned());
    args.push(serial.join(","));

    args
}
