//! CPU usage probes.
//!
//! A probe answers one question on demand: "how busy is the thing I watch right
//! now?". The machine-wide probe reads the global CPU counter, the family probe
//! sums the CPU share of every process that belongs to a named application
//! family (e.g. Chromium and all of its helper processes).

use std::collections::HashSet;
use std::io::ErrorKind;
use std::process::Command;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use thiserror::Error;

use crate::config::{ProcessTableBackend, SamplingSettings};

/// Failure to produce a single usage reading.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("usage probe unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read process table: {0}")]
    Io(#[from] std::io::Error),
}

/// A capability returning the current usage percentage.
///
/// Values fall within `[0, 100 * core_count]`.
pub trait UsageProbe: Send {
    fn sample(&mut self) -> Result<f64, ProbeError>;
}

impl<F> UsageProbe for F
where
    F: FnMut() -> Result<f64, ProbeError> + Send,
{
    fn sample(&mut self) -> Result<f64, ProbeError> {
        self()
    }
}

/// What a sampler measures for a given benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum UsageScope {
    /// Whole-machine CPU usage.
    Machine,
    /// CPU usage of one application family.
    Family(ProcessFamily),
}

impl std::fmt::Display for UsageScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageScope::Machine => write!(f, "machine"),
            UsageScope::Family(family) => write!(f, "family:{}", family.name),
        }
    }
}

/// Named set of command-line patterns identifying an application's processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFamily {
    pub name: String,
    pub patterns: Vec<String>,
}

impl ProcessFamily {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns,
        }
    }

    /// Chromium-derived browsers, including branded Chrome builds.
    pub fn chromium() -> Self {
        Self::new(
            "chromium",
            vec![
                "Chromium".into(),
                "Google Chrome".into(),
                "chrome".into(),
                "chromium".into(),
            ],
        )
    }

    pub fn matches(&self, command: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && command.contains(pattern.as_str()))
    }
}

/// One row of a process table snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub cpu_percent: f64,
    pub command: String,
}

/// Returns the PIDs belonging to `family`.
///
/// Pass one marks rows whose command matches a pattern. Pass two marks rows
/// whose parent is marked and repeats until nothing changes, so helpers of
/// helpers are included as well.
pub fn classify_family(rows: &[ProcessRow], family: &ProcessFamily) -> HashSet<u32> {
    let mut marked: HashSet<u32> = rows
        .iter()
        .filter(|row| family.matches(&row.command))
        .map(|row| row.pid)
        .collect();

    loop {
        let before = marked.len();
        for row in rows {
            if let Some(ppid) = row.ppid {
                if marked.contains(&ppid) {
                    marked.insert(row.pid);
                }
            }
        }
        if marked.len() == before {
            break;
        }
    }

    marked
}

/// Source of process table snapshots.
pub trait ProcessTable: Send {
    fn snapshot(&mut self) -> Result<Vec<ProcessRow>, ProbeError>;
}

/// Process table read through `sysinfo`.
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn new() -> Result<Self, ProbeError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ProbeError::Unavailable(format!(
                "sysinfo does not support {}",
                std::env::consts::OS
            )));
        }
        let mut system = System::new();
        // CPU deltas need a previous refresh to compare against.
        system.refresh_processes();
        Ok(Self { system })
    }
}

impl ProcessTable for SysinfoTable {
    fn snapshot(&mut self) -> Result<Vec<ProcessRow>, ProbeError> {
        self.system.refresh_processes();
        let rows = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let cmd = process.cmd();
                let command = if cmd.is_empty() {
                    process.name().to_string()
                } else {
                    cmd.join(" ")
                };
                ProcessRow {
                    pid: pid.as_u32(),
                    ppid: process.parent().map(|parent| parent.as_u32()),
                    cpu_percent: f64::from(process.cpu_usage()),
                    command,
                }
            })
            .collect();
        Ok(rows)
    }
}

/// Process table read from `ps -A -o pid=,ppid=,%cpu=,args=`.
#[derive(Debug, Default)]
pub struct PsTable;

impl ProcessTable for PsTable {
    fn snapshot(&mut self) -> Result<Vec<ProcessRow>, ProbeError> {
        let output = match Command::new("ps")
            .args(["-A", "-o", "pid=,ppid=,%cpu=,args="])
            .output()
        {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ProbeError::Unavailable("ps not found on PATH".into()));
            }
            Err(err) => return Err(err.into()),
        };
        if !output.status.success() {
            return Err(ProbeError::Unavailable(format!(
                "ps exited with {}",
                output.status
            )));
        }
        parse_ps_table(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `pid ppid %cpu args...` rows. Header and malformed rows are skipped.
pub fn parse_ps_table(raw: &str) -> Result<Vec<ProcessRow>, ProbeError> {
    let rows: Vec<ProcessRow> = raw.lines().filter_map(parse_ps_line).collect();
    if rows.is_empty() {
        return Err(ProbeError::Unavailable(
            "ps output contained no process rows".into(),
        ));
    }
    Ok(rows)
}

fn parse_ps_line(line: &str) -> Option<ProcessRow> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse::<u32>().ok()?;
    let ppid = fields.next()?.parse::<u32>().ok()?;
    let cpu_percent = fields.next()?.replace(',', ".").parse::<f64>().ok()?;
    let command = fields.collect::<Vec<_>>().join(" ");
    Some(ProcessRow {
        pid,
        ppid: (ppid != 0).then_some(ppid),
        cpu_percent,
        command,
    })
}

/// Sums the CPU share of one process family.
pub struct FamilyProbe<T> {
    family: ProcessFamily,
    table: T,
    own_pid: u32,
}

impl<T: ProcessTable> FamilyProbe<T> {
    pub fn new(family: ProcessFamily, table: T) -> Self {
        Self {
            family,
            table,
            own_pid: std::process::id(),
        }
    }
}

impl<T: ProcessTable> UsageProbe for FamilyProbe<T> {
    fn sample(&mut self) -> Result<f64, ProbeError> {
        let mut rows = self.table.snapshot()?;
        // The harness binary itself matches "chrome" patterns.
        rows.retain(|row| row.pid != self.own_pid);
        let members = classify_family(&rows, &self.family);
        Ok(rows
            .iter()
            .filter(|row| members.contains(&row.pid))
            .map(|row| row.cpu_percent)
            .sum())
    }
}

/// Global CPU usage across all cores.
pub struct MachineProbe {
    system: System,
}

impl MachineProbe {
    pub fn new() -> Result<Self, ProbeError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ProbeError::Unavailable(format!(
                "sysinfo does not support {}",
                std::env::consts::OS
            )));
        }
        let mut system = System::new();
        system.refresh_cpu();
        Ok(Self { system })
    }
}

impl UsageProbe for MachineProbe {
    fn sample(&mut self) -> Result<f64, ProbeError> {
        self.system.refresh_cpu();
        let usage = f64::from(self.system.global_cpu_info().cpu_usage());
        if usage.is_finite() {
            Ok(usage)
        } else {
            Err(ProbeError::Unavailable("global CPU usage was not a number".into()))
        }
    }
}

/// Probe that fails every tick. Stands in when a scope cannot be measured.
pub struct UnavailableProbe {
    reason: String,
}

impl UnavailableProbe {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl UsageProbe for UnavailableProbe {
    fn sample(&mut self) -> Result<f64, ProbeError> {
        Err(ProbeError::Unavailable(self.reason.clone()))
    }
}

/// Builds a fresh probe for a scope.
pub trait ProbeProvider: Send + Sync {
    fn probe_for(&self, scope: &UsageScope) -> Box<dyn UsageProbe>;
}

/// Probes backed by the host operating system.
#[derive(Debug, Clone)]
pub struct SystemProbes {
    backend: ProcessTableBackend,
}

impl SystemProbes {
    pub fn new(backend: ProcessTableBackend) -> Self {
        Self { backend }
    }

    pub fn from_settings(settings: &SamplingSettings) -> Self {
        Self::new(settings.process_table)
    }
}

impl ProbeProvider for SystemProbes {
    fn probe_for(&self, scope: &UsageScope) -> Box<dyn UsageProbe> {
        let built: Result<Box<dyn UsageProbe>, ProbeError> = match scope {
            UsageScope::Machine => {
                MachineProbe::new().map(|probe| Box::new(probe) as Box<dyn UsageProbe>)
            }
            UsageScope::Family(family) => match self.backend {
                ProcessTableBackend::Sysinfo => SysinfoTable::new().map(|table| {
                    Box::new(FamilyProbe::new(family.clone(), table)) as Box<dyn UsageProbe>
                }),
                ProcessTableBackend::Ps => Ok(Box::new(FamilyProbe::new(family.clone(), PsTable))),
            },
        };
        built.unwrap_or_else(|err| {
            tracing::warn!(scope = %scope, error = %err, "usage probe unavailable; samples will be empty");
            Box::new(UnavailableProbe::new(err.to_string()))
        })
    }
}
