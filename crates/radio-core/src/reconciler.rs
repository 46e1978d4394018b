//! Hourly reconciliation of desired versus running capture processes.
//!
//! A pass takes one process snapshot and walks every station against it:
//!
//! ```text
//!   desired OFF ─────────────► terminate every continuous capture
//!   desired ON  ─┬ current ──► keep the first, terminate duplicates
//!                ├ stale ────► terminate, then start fresh
//!                └ absent ───► disk floor ─► resolve ─► launch
//! ```
//!
//! Stations are independent: any error is logged against the station and
//! the pass moves on. Manual captures carry their own tag and are left to
//! finish on their own; they only block a continuous start when they write
//! the file the segment muxer would open for the current hour.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::disk::{bytes_to_gib, DiskGuard};
use crate::error::{RecorderError, Result};
use crate::inventory::{CaptureProcess, ProcessInventory};
use crate::launcher::{self, CaptureJob, CaptureLauncher};
use crate::resolver::StreamResolver;
use crate::station::{Activity, DesiredState, Station, StationDraft};
use crate::store::StationStore;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the reconciler reads from configuration.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub recordings_dir: PathBuf,
    pub extension: String,
    pub min_free_gib: f64,
    pub manual_duration: Duration,
    /// Zone that dates and hours are named in; host zone when unset.
    pub timezone: Option<Tz>,
}

impl RecorderSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let timezone = config
            .capture
            .timezone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>().map_err(|e| {
                    RecorderError::Validation(format!("unknown capture timezone {name:?}: {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            recordings_dir: config.paths.recordings_dir.clone(),
            extension: config.capture.extension.clone(),
            min_free_gib: config.disk.min_free_gib,
            manual_duration: Duration::from_secs(config.capture.manual_seconds),
            timezone,
        })
    }

    /// Wall-clock time in the recording zone.
    pub fn now(&self) -> NaiveDateTime {
        self.wall_clock(Utc::now())
    }

    pub fn wall_clock(&self, at: DateTime<Utc>) -> NaiveDateTime {
        match self.timezone {
            Some(tz) => at.with_timezone(&tz).naive_local(),
            None => at.with_timezone(&Local).naive_local(),
        }
    }
}

/// Manual recording length from a whole number of minutes.
pub fn duration_from_minutes(minutes: u64) -> Result<Duration> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| RecorderError::Validation(format!("{minutes} minutes is too long")))
}

/// Whether `process` writes the file for `now`'s hour inside `dir`.
///
/// A continuous capture in `dir` names its segments by `%H`, so it always
/// does; a manual one only if its output is `{dir}/{HH}.*`.
pub fn writes_hour_file(process: &CaptureProcess, dir: &Path, now: NaiveDateTime) -> bool {
    if !process.is_manual() {
        return process.targets_dir(dir);
    }
    let hour_file = dir.join(format!("{:02}.", now.hour()));
    process
        .command_line
        .contains(hour_file.to_string_lossy().as_ref())
}

/// Tagged captures whose station is no longer stored.
pub fn orphaned_captures<'a>(
    stations: &[Station],
    snapshot: &'a [CaptureProcess],
) -> Vec<&'a CaptureProcess> {
    snapshot
        .iter()
        .filter(|p| {
            p.tagged_station()
                .is_some_and(|tag| !stations.iter().any(|s| s.name == tag))
        })
        .collect()
}

/// How a station's running processes relate to the hour directory it should write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    CorrectlyTargeted,
    Stale,
    Absent,
}

/// Per-station decision derived from one snapshot. Pure; no side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationPlan {
    pub desired: DesiredState,
    pub status: ProcessStatus,
    pub keep: Vec<u32>,
    pub terminate: Vec<u32>,
    pub start: bool,
}

pub fn plan_station(
    station: &Station,
    snapshot: &[CaptureProcess],
    expected_dir: &Path,
    now: NaiveDateTime,
) -> StationPlan {
    let desired = station.desired_state(now);
    let (manual, continuous): (Vec<&CaptureProcess>, Vec<&CaptureProcess>) = snapshot
        .iter()
        .filter(|p| p.belongs_to(station))
        .partition(|p| p.is_manual());
    let (current, stale): (Vec<&CaptureProcess>, Vec<&CaptureProcess>) = continuous
        .iter()
        .copied()
        .partition(|p| p.targets_dir(expected_dir));

    // a manual file named after this hour would collide with the segment muxer
    let manual_in_hour = manual
        .iter()
        .any(|p| writes_hour_file(p, expected_dir, now));
    let status = if !current.is_empty() || manual_in_hour {
        ProcessStatus::CorrectlyTargeted
    } else if !stale.is_empty() {
        ProcessStatus::Stale
    } else {
        ProcessStatus::Absent
    };

    match desired {
        DesiredState::Off => StationPlan {
            desired,
            status,
            keep: Vec::new(),
            terminate: continuous.iter().map(|p| p.pid).collect(),
            start: false,
        },
        DesiredState::On => {
            // snapshot is pid-ordered, so the oldest survivor is kept
            let keep: Vec<u32> = current.iter().take(1).map(|p| p.pid).collect();
            let terminate = current
                .iter()
                .skip(1)
                .chain(stale.iter())
                .map(|p| p.pid)
                .collect();
            StationPlan {
                desired,
                status,
                keep,
                terminate,
                start: status != ProcessStatus::CorrectlyTargeted,
            }
        }
    }
}

/// Result of one station within a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StationAction {
    Idle,
    Kept { pid: Option<u32> },
    Started { pid: u32 },
    Stopped,
    SkippedDisk { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationOutcome {
    pub station: String,
    pub desired: DesiredState,
    pub status: ProcessStatus,
    pub terminated: Vec<u32>,
    pub kill_failures: Vec<u32>,
    #[serde(flatten)]
    pub action: StationAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub at: Option<NaiveDateTime>,
    pub stations: Vec<StationOutcome>,
    /// Captures still tagged with a station that has since been deleted.
    pub orphans_terminated: Vec<u32>,
}

impl TickReport {
    pub fn started(&self) -> usize {
        self.count(|a| matches!(a, StationAction::Started { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|a| {
            matches!(
                a,
                StationAction::Failed { .. } | StationAction::SkippedDisk { .. }
            )
        })
    }

    pub fn terminated(&self) -> usize {
        self.stations.iter().map(|s| s.terminated.len()).sum::<usize>()
            + self.orphans_terminated.len()
    }

    fn count(&self, pred: impl Fn(&StationAction) -> bool) -> usize {
        self.stations.iter().filter(|s| pred(&s.action)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualStart {
    pub station: String,
    pub pid: u32,
    pub output: PathBuf,
    pub duration_secs: u64,
    pub encode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationStatus {
    pub name: String,
    pub source_url: String,
    pub resolved_url: String,
    pub activity: Activity,
    pub desired: DesiredState,
    pub status: ProcessStatus,
    pub pids: Vec<u32>,
    pub manual_pids: Vec<u32>,
}

/// Readiness of the host for recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrepReport {
    pub recordings_dir: PathBuf,
    pub free_gib: Option<f64>,
    pub min_free_gib: f64,
    pub disk_ok: bool,
    pub ffmpeg: Option<PathBuf>,
    pub ffmpeg_version: Option<String>,
    pub problems: Vec<String>,
}

impl PrepReport {
    pub fn ready(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Owns the collaborators and runs every station-level operation.
pub struct Recorder<R> {
    store: Arc<dyn StationStore>,
    resolver: R,
    inventory: Arc<dyn ProcessInventory>,
    launcher: Arc<dyn CaptureLauncher>,
    disk: Arc<dyn DiskGuard>,
    settings: RecorderSettings,
    /// Serializes passes and manual operations against the process table.
    pass: Mutex<()>,
}

impl<R: StreamResolver> Recorder<R> {
    pub fn new(
        store: Arc<dyn StationStore>,
        resolver: R,
        inventory: Arc<dyn ProcessInventory>,
        launcher: Arc<dyn CaptureLauncher>,
        disk: Arc<dyn DiskGuard>,
        settings: RecorderSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            inventory,
            launcher,
            disk,
            settings,
            pass: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn stations(&self) -> Result<Vec<Station>> {
        self.store.list()
    }

    /// One reconciliation pass at the current wall-clock time.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(self.settings.now()).await
    }

    pub async fn tick_at(&self, now: NaiveDateTime) -> Result<TickReport> {
        let _pass = self.pass.lock().await;
        let stations = self.store.list()?;
        let snapshot = self.inventory.snapshot();
        info!(
            "[reconcile] tick at {}: {} station(s), {} capture process(es)",
            now.format("%Y-%m-%d %H:%M:%S"),
            stations.len(),
            snapshot.len()
        );

        let mut report = TickReport {
            at: Some(now),
            stations: Vec::with_capacity(stations.len()),
            orphans_terminated: Vec::new(),
        };
        for station in &stations {
            let outcome = self.reconcile_station(station, &snapshot, now).await;
            report.stations.push(outcome);
        }
        for orphan in orphaned_captures(&stations, &snapshot) {
            let tag = orphan.tagged_station().unwrap_or_default();
            warn!("[reconcile] PID {} records deleted station {}", orphan.pid, tag);
            let (done, _) = self.terminate_all(tag, &[orphan.pid]);
            report.orphans_terminated.extend(done);
        }
        info!(
            "[reconcile] tick done: {} started, {} terminated, {} failed",
            report.started(),
            report.terminated(),
            report.failed()
        );
        Ok(report)
    }

    async fn reconcile_station(
        &self,
        station: &Station,
        snapshot: &[CaptureProcess],
        now: NaiveDateTime,
    ) -> StationOutcome {
        let expected = launcher::expected_dir(&self.settings.recordings_dir, &station.name, now);
        let plan = plan_station(station, snapshot, &expected, now);
        debug!(
            "[reconcile] {}: desired {:?}, status {:?}, keep {:?}, terminate {:?}",
            station.name, plan.desired, plan.status, plan.keep, plan.terminate
        );

        let (terminated, kill_failures) = self.terminate_all(&station.name, &plan.terminate);

        let action = if plan.start {
            match self.start_continuous(station, now).await {
                Ok(pid) => StationAction::Started { pid },
                Err(e @ RecorderError::InsufficientDisk { .. }) => {
                    warn!("[reconcile] {}: not started, {}", station.name, e);
                    StationAction::SkippedDisk {
                        reason: e.to_string(),
                    }
                }
                Err(e) => {
                    error!("[reconcile] {}: start failed: {}", station.name, e);
                    StationAction::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        } else if plan.desired == DesiredState::On {
            StationAction::Kept {
                pid: plan.keep.first().copied(),
            }
        } else if plan.terminate.is_empty() {
            StationAction::Idle
        } else {
            StationAction::Stopped
        };

        StationOutcome {
            station: station.name.clone(),
            desired: plan.desired,
            status: plan.status,
            terminated,
            kill_failures,
            action,
        }
    }

    /// Best effort: one failed kill never stops the rest.
    fn terminate_all(&self, station: &str, pids: &[u32]) -> (Vec<u32>, Vec<u32>) {
        let mut done = Vec::new();
        let mut failed = Vec::new();
        for &pid in pids {
            match self.launcher.terminate(pid) {
                Ok(()) => {
                    info!("[reconcile] {}: terminated PID {}", station, pid);
                    done.push(pid);
                }
                Err(e) => {
                    error!("[reconcile] {}: could not terminate PID {}: {}", station, pid, e);
                    failed.push(pid);
                }
            }
        }
        (done, failed)
    }

    /// Last-known-good URL first; the operator's URL is re-resolved when
    /// that stops working (playlists may have moved to new servers).
    async fn resolve_for_capture(&self, station: &Station) -> Result<String> {
        let known = if station.resolved_url.is_empty() {
            &station.source_url
        } else {
            &station.resolved_url
        };
        match self.resolver.resolve(known).await {
            Ok(url) => Ok(url),
            Err(e) if *known != station.source_url => {
                warn!(
                    "[reconcile] {}: {} failed ({}), re-resolving {}",
                    station.name, known, e, station.source_url
                );
                Ok(self.resolver.resolve(&station.source_url).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn start_continuous(&self, station: &Station, now: NaiveDateTime) -> Result<u32> {
        self.disk
            .ensure_space(&self.settings.recordings_dir, self.settings.min_free_gib)?;
        let url = self.resolve_for_capture(station).await?;
        let job = CaptureJob::segmented(
            &self.settings.recordings_dir,
            &station.name,
            &url,
            now,
            &self.settings.extension,
        );
        self.launcher.launch(&job)
    }

    /// Fixed-duration capture outside the schedule.
    pub async fn start_manual(
        &self,
        name: &str,
        duration_override: Option<Duration>,
        encode: bool,
    ) -> Result<ManualStart> {
        self.start_manual_at(name, duration_override, encode, self.settings.now())
            .await
    }

    pub async fn start_manual_at(
        &self,
        name: &str,
        duration_override: Option<Duration>,
        encode: bool,
        now: NaiveDateTime,
    ) -> Result<ManualStart> {
        let _pass = self.pass.lock().await;
        let station = self
            .store
            .get(name)?
            .ok_or_else(|| RecorderError::UnknownStation(name.to_string()))?;
        let duration = duration_override.unwrap_or(self.settings.manual_duration);
        if duration.is_zero() {
            return Err(RecorderError::Validation(
                "manual recording duration must be positive".to_string(),
            ));
        }

        let dir = launcher::expected_dir(&self.settings.recordings_dir, &station.name, now);
        let snapshot = self.inventory.snapshot();
        if let Some(busy) = snapshot
            .iter()
            .find(|p| p.belongs_to(&station) && writes_hour_file(p, &dir, now))
        {
            return Err(RecorderError::Validation(format!(
                "{} is already recording {}/{:02} (PID {})",
                station.name,
                dir.display(),
                now.hour(),
                busy.pid
            )));
        }

        self.disk
            .ensure_space(&self.settings.recordings_dir, self.settings.min_free_gib)?;
        let url = self.resolve_for_capture(&station).await?;
        let job = CaptureJob::manual(
            &self.settings.recordings_dir,
            &station.name,
            &url,
            now,
            &self.settings.extension,
            duration,
            encode,
        );
        let pid = self.launcher.launch(&job)?;
        info!(
            "[reconcile] manual recording of {} for {}s (encode: {}), PID: {}",
            station.name,
            duration.as_secs(),
            encode,
            pid
        );
        Ok(ManualStart {
            station: station.name,
            pid,
            output: job.output(),
            duration_secs: duration.as_secs(),
            encode,
        })
    }

    /// Terminate every capture, continuous or manual, for one station.
    pub async fn stop_station(&self, name: &str) -> Result<Vec<u32>> {
        let _pass = self.pass.lock().await;
        let station = self
            .store
            .get(name)?
            .ok_or_else(|| RecorderError::UnknownStation(name.to_string()))?;
        self.stop_matching(&[station], false)
    }

    /// Terminate every capture of every station, including captures left
    /// behind by stations that were deleted while still recording.
    pub async fn stop_all(&self) -> Result<Vec<u32>> {
        let _pass = self.pass.lock().await;
        let stations = self.store.list()?;
        self.stop_matching(&stations, true)
    }

    fn stop_matching(&self, stations: &[Station], with_orphans: bool) -> Result<Vec<u32>> {
        let snapshot = self.inventory.snapshot();
        let mut stopped = Vec::new();
        let mut failures = 0usize;
        for station in stations {
            let pids: Vec<u32> = snapshot
                .iter()
                .filter(|p| p.belongs_to(station))
                .map(|p| p.pid)
                .filter(|pid| !stopped.contains(pid))
                .collect();
            let (done, failed) = self.terminate_all(&station.name, &pids);
            stopped.extend(done);
            failures += failed.len();
        }
        if with_orphans {
            for orphan in orphaned_captures(stations, &snapshot) {
                let tag = orphan.tagged_station().unwrap_or_default();
                let (done, failed) = self.terminate_all(tag, &[orphan.pid]);
                stopped.extend(done);
                failures += failed.len();
            }
        }
        if failures > 0 {
            return Err(RecorderError::ProcessControl(format!(
                "{failures} capture process(es) could not be terminated"
            )));
        }
        info!("[reconcile] stopped {} capture process(es)", stopped.len());
        Ok(stopped)
    }

    /// Validate, reject duplicates, resolve, persist. Nothing is stored
    /// unless a working stream was found.
    pub async fn add_station(&self, draft: StationDraft) -> Result<Station> {
        draft.validate()?;
        if self.store.get(&draft.name)?.is_some() {
            return Err(RecorderError::Validation(format!(
                "station {} already exists",
                draft.name
            )));
        }
        let resolved = self.resolver.resolve(draft.source_url.trim()).await?;
        let mut draft = draft;
        draft.source_url = draft.source_url.trim().to_string();
        let station = draft.into_station(resolved);
        self.store.create(&station)?;
        info!(
            "[reconcile] added station {} ({:?}) -> {}",
            station.name,
            station.activity(),
            station.resolved_url
        );
        Ok(station)
    }

    /// Stop the station's captures, then forget it. A capture that survives
    /// the stop is swept up by the next pass or `stop_all`.
    pub async fn delete_station(&self, name: &str) -> Result<()> {
        if let Err(e) = self.stop_station(name).await {
            match e {
                RecorderError::ProcessControl(_) => {
                    warn!("[reconcile] {}: deleting despite stop failure: {}", name, e)
                }
                other => return Err(other),
            }
        }
        self.store.delete(name)?;
        info!("[reconcile] deleted station {}", name);
        Ok(())
    }

    /// Resolve a URL without persisting anything.
    pub async fn test_stream(&self, url: &str) -> Result<String> {
        Ok(self.resolver.resolve(url).await?)
    }

    pub fn status(&self) -> Result<Vec<StationStatus>> {
        self.status_at(self.settings.now())
    }

    pub fn status_at(&self, now: NaiveDateTime) -> Result<Vec<StationStatus>> {
        let stations = self.store.list()?;
        let snapshot = self.inventory.snapshot();
        Ok(stations
            .into_iter()
            .map(|station| {
                let expected =
                    launcher::expected_dir(&self.settings.recordings_dir, &station.name, now);
                let plan = plan_station(&station, &snapshot, &expected, now);
                let (manual, continuous): (Vec<&CaptureProcess>, Vec<&CaptureProcess>) = snapshot
                    .iter()
                    .filter(|p| p.belongs_to(&station))
                    .partition(|p| p.is_manual());
                StationStatus {
                    activity: station.activity(),
                    desired: plan.desired,
                    status: plan.status,
                    pids: continuous.iter().map(|p| p.pid).collect(),
                    manual_pids: manual.iter().map(|p| p.pid).collect(),
                    name: station.name,
                    source_url: station.source_url,
                    resolved_url: station.resolved_url,
                }
            })
            .collect())
    }

    /// Disk floor plus a bounded `ffmpeg -version` run.
    pub async fn prep(&self) -> PrepReport {
        let dir = &self.settings.recordings_dir;
        let mut problems = Vec::new();

        let free_gib = match self.disk.free_bytes(dir) {
            Ok(bytes) => Some(bytes_to_gib(bytes)),
            Err(e) => {
                problems.push(format!("cannot read free space for {}: {e}", dir.display()));
                None
            }
        };
        let disk_ok = free_gib.is_some_and(|free| free >= self.settings.min_free_gib);
        if let (Some(free), false) = (free_gib, disk_ok) {
            problems.push(format!(
                "{free:.2} GiB free on {}, {:.2} GiB required",
                dir.display(),
                self.settings.min_free_gib
            ));
        }

        let ffmpeg = self.launcher.binary().map(Path::to_path_buf);
        let ffmpeg_version = match &ffmpeg {
            Some(path) => match launcher::binary_version(path, VERSION_CHECK_TIMEOUT).await {
                Ok(version) => Some(version),
                Err(e) => {
                    problems.push(e.to_string());
                    None
                }
            },
            None => {
                problems.push("ffmpeg binary not found".to_string());
                None
            }
        };

        for problem in &problems {
            warn!("[reconcile] prep: {}", problem);
        }
        PrepReport {
            recordings_dir: dir.clone(),
            free_gib,
            min_free_gib: self.settings.min_free_gib,
            disk_ok,
            ffmpeg,
            ffmpeg_version,
            problems,
        }
    }
}
