pub mod log_tail;
pub mod service;
pub mod system;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Raw virtual memory counters, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub buffers_bytes: u64,
}

/// Usage of one mounted partition, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUsage {
    pub mount: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Everything the report needs from the operating system.
///
/// The live implementation is [`system::SysinfoHost`]; tests supply fixed values.
pub trait HostSource {
    fn host_name(&self) -> Result<String, ProbeError>;
    fn outbound_ip(&self, target: SocketAddr) -> Result<IpAddr, ProbeError>;
    fn memory(&self) -> MemoryCounters;
    /// Physical partitions in enumeration order. A partition that cannot be
    /// statted is reported as [`ProbeError::PartitionUnreadable`].
    fn partitions(&self) -> Vec<Result<PartitionUsage, ProbeError>>;
    fn cpu_count(&self) -> usize;
    fn load_average_line(&self) -> Result<String, ProbeError>;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no outbound route towards {target}: {source}")]
    NetworkUnreachable {
        target: SocketAddr,
        source: io::Error,
    },
    #[error("{what} is unavailable: {reason}")]
    SourceUnavailable { what: &'static str, reason: String },
    #[error("service command '{command}' failed: {failure}")]
    CommandExecutionFailed {
        command: String,
        failure: CommandFailure,
    },
    #[error("partition {mount} cannot be statted: {source}")]
    PartitionUnreadable { mount: String, source: io::Error },
    #[error("cannot read log file {path}: {source}")]
    LogFileUnreadable { path: String, source: io::Error },
}

#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("command is empty")]
    Empty,
    #[error("could not start: {0}")]
    Spawn(#[source] io::Error),
    #[error("exited with {}: {stderr}", describe_exit(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("timed out after {}", describe_timeout(.0))]
    Timeout(Duration),
}

fn describe_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
