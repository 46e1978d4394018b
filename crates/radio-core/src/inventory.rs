//! Running capture processes, read from the OS process table.

use std::path::Path;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

use crate::launcher::{MANUAL_TAG_PREFIX, TAG_PREFIX};
use crate::platform;
use crate::station::Station;

/// One capture process as seen in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureProcess {
    pub pid: u32,
    pub args: Vec<String>,
    pub command_line: String,
}

impl CaptureProcess {
    pub fn new(pid: u32, args: Vec<String>) -> Self {
        let command_line = args.join(" ");
        Self {
            pid,
            args,
            command_line,
        }
    }

    /// Station name from the `-metadata comment=...` tag, if the process has one.
    pub fn tagged_station(&self) -> Option<&str> {
        self.args.iter().find_map(|a| {
            a.strip_prefix(TAG_PREFIX)
                .or_else(|| a.strip_prefix(MANUAL_TAG_PREFIX))
        })
    }

    /// Fixed-duration capture that will exit on its own.
    pub fn is_manual(&self) -> bool {
        self.args.iter().any(|a| a.starts_with(MANUAL_TAG_PREFIX))
    }

    /// Tagged processes match on the tag alone; untagged ones fall back to
    /// a substring match of the station's URLs against the command line.
    pub fn belongs_to(&self, station: &Station) -> bool {
        match self.tagged_station() {
            Some(tagged) => tagged == station.name,
            None => station.match_urls().any(|url| self.command_line.contains(url)),
        }
    }

    /// Whether the command line writes somewhere inside `dir`.
    pub fn targets_dir(&self, dir: &Path) -> bool {
        let with_sep = dir.join("");
        self.command_line.contains(&*with_sep.to_string_lossy())
    }
}

pub trait ProcessInventory: Send + Sync {
    /// Taken once per reconciliation pass and shared by every station.
    fn snapshot(&self) -> Vec<CaptureProcess>;
}

/// Whether a process-table entry is a capture binary invocation.
pub fn is_capture_command(name: &str, args: &[String]) -> bool {
    let names = platform::capture_process_names();
    if names.contains(&name) {
        return true;
    }
    args.first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|f| f.to_str())
        .is_some_and(|f| names.contains(&f))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInventory;

impl ProcessInventory for SystemInventory {
    fn snapshot(&self) -> Vec<CaptureProcess> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        let mut found: Vec<CaptureProcess> = sys
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let name = process.name().to_string_lossy();
                let args: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                is_capture_command(&name, &args).then(|| CaptureProcess::new(pid.as_u32(), args))
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        debug!("[inventory] {} capture process(es) running", found.len());
        found
    }
}
