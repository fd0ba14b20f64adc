//! Hierarchy discovery.
//!
//! Two hierarchies are supported:
//!
//! - **Address space**: an octree-style index where each node is a decimal
//!   digit string. The parent of `v` is `floor(v / 10)`, i.e. the address
//!   with its last digit removed. Addresses are discovered by running the
//!   target program with a probe flag and reading one address per line.
//! - **Directory tree**: see [`tree`]. Parent links there are implicit in the
//!   walk, so this module only provides the listing primitives.
//!
//! # Root depth
//!
//! The depth of an address is its digit length, with one exception: the
//! global root `"0"` is pinned to depth 0 even though its string length is
//! 1. Without the exception the root would share depth 1 with its own
//! children and could be batched alongside them.

pub mod tree;

use std::fmt;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The designated root address.
pub const ROOT_ADDRESS: &str = "0";

/// A node address in the spatial index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parse an address from one line of probe output.
    ///
    /// Returns `None` for empty input or anything that is not all ASCII
    /// digits. Leading zeros are stripped, so `"012"` is address `12` and
    /// `"00"` is the root.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = raw.trim_start_matches('0');
        if digits.is_empty() {
            Some(Self(ROOT_ADDRESS.to_string()))
        } else {
            Some(Self(digits.to_string()))
        }
    }

    /// The address as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the global root `"0"`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ADDRESS
    }

    /// Distance from the root: the digit length, except `"0"` which is 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() { 0 } else { self.0.len() }
    }

    /// The parent address, `floor(v / 10)`. The root has no parent and
    /// single-digit addresses hang off the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let head = &self.0[..self.0.len() - 1];
        if head.is_empty() {
            Some(Self(ROOT_ADDRESS.to_string()))
        } else {
            Some(Self(head.to_string()))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from the address probe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// The probe command line was empty.
    #[error("probe command is empty")]
    EmptyCommand,

    /// The target program could not be started.
    #[error("failed to spawn address probe '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the probe or reading its output failed.
    #[error("failed to collect address probe output: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse probe output into addresses, in discovery order.
///
/// Empty and non-numeric lines are skipped and duplicates collapse onto
/// their first occurrence.
#[must_use]
pub fn parse_addresses(output: &str) -> Vec<Address> {
    let mut seen = std::collections::HashSet::new();
    let mut addresses = Vec::new();
    for line in output.lines() {
        match Address::parse(line) {
            Some(address) => {
                if address.as_str() != line.trim() {
                    warn!(line = line.trim(), address = %address, "normalized zero-padded address");
                }
                if seen.insert(address.clone()) {
                    addresses.push(address);
                }
            },
            None => {
                if !line.trim().is_empty() {
                    debug!(line = line.trim(), "ignoring non-numeric probe line");
                }
            },
        }
    }
    addresses
}

/// Run `command` with `probe_flag` appended and parse its stdout into
/// addresses.
///
/// Stderr is relayed to the log. A probe that exits non-zero is reported
/// at warn level but its output is still used.
///
/// # Errors
///
/// Returns `ProbeError::Spawn` if the program cannot be started and
/// `ProbeError::Io` if its output cannot be collected.
pub async fn probe_addresses(
    command: &[String],
    probe_flag: &str,
) -> Result<Vec<Address>, ProbeError> {
    let (program, args) = command.split_first().ok_or(ProbeError::EmptyCommand)?;

    info!(program = %program, flag = probe_flag, "probing target for addresses");

    let output = Command::new(program)
        .args(args)
        .arg(probe_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| ProbeError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        warn!(program = %program, "probe stderr: {line}");
    }
    if !output.status.success() {
        warn!(
            program = %program,
            status = %output.status,
            "address probe exited unsuccessfully; using the output it produced"
        );
    }

    let addresses = parse_addresses(&String::from_utf8_lossy(&output.stdout));
    info!(count = addresses.len(), "discovered addresses");
    Ok(addresses)
}
