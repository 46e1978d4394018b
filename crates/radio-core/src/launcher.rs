//! Capture process construction and control.
//!
//! Output layout is `{base}/{station}/{date}/{hour}.{ext}`. Continuous
//! recordings hand ffmpeg a `%H.{ext}` pattern inside the date directory and
//! let the segment muxer rotate on clock-hour boundaries; manual recordings
//! write a single file for the current hour and stop after a fixed duration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::error::{RecorderError, Result};

/// Prefix of the `-metadata` value every continuous capture carries.
pub const TAG_PREFIX: &str = "comment=radio-recorder:";
/// Same for fixed-duration manual captures.
pub const MANUAL_TAG_PREFIX: &str = "comment=radio-recorder-manual:";

pub fn station_tag(station: &str) -> String {
    format!("{TAG_PREFIX}{station}")
}

pub fn manual_station_tag(station: &str) -> String {
    format!("{MANUAL_TAG_PREFIX}{station}")
}

/// Date directory for a capture started at `started`.
pub fn segment_date(started: NaiveDateTime) -> NaiveDate {
    started.date()
}

pub fn station_day_dir(base: &Path, station: &str, date: NaiveDate) -> PathBuf {
    base.join(station).join(date.format("%Y-%m-%d").to_string())
}

/// Directory a correctly targeted continuous capture writes into at `now`.
pub fn expected_dir(base: &Path, station: &str, now: NaiveDateTime) -> PathBuf {
    station_day_dir(base, station, segment_date(now))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Hour-aligned segments, runs until killed.
    Segmented,
    /// One file, stops itself after `duration`.
    Manual { duration: Duration, encode: bool },
}

/// Everything needed to start one capture process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureJob {
    pub station: String,
    pub input_url: String,
    /// Directory the process writes into.
    pub dir: PathBuf,
    /// Segment pattern (`%H.mp3`) or concrete file name (`14.mp3`).
    pub file_name: String,
    pub mode: CaptureMode,
}

impl CaptureJob {
    pub fn segmented(
        base: &Path,
        station: &str,
        input_url: &str,
        now: NaiveDateTime,
        ext: &str,
    ) -> Self {
        Self {
            station: station.to_string(),
            input_url: input_url.to_string(),
            dir: expected_dir(base, station, now),
            file_name: format!("%H.{ext}"),
            mode: CaptureMode::Segmented,
        }
    }

    pub fn manual(
        base: &Path,
        station: &str,
        input_url: &str,
        now: NaiveDateTime,
        ext: &str,
        duration: Duration,
        encode: bool,
    ) -> Self {
        Self {
            station: station.to_string(),
            input_url: input_url.to_string(),
            dir: station_day_dir(base, station, now.date()),
            file_name: format!("{:02}.{ext}", now.hour()),
            mode: CaptureMode::Manual { duration, encode },
        }
    }

    pub fn output(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// ffmpeg arguments, input first, output last.
    pub fn args(&self, segment_seconds: u64) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-i".into(),
            self.input_url.clone(),
            "-vn".into(),
        ];
        match self.mode {
            CaptureMode::Manual { encode: true, .. } => {
                args.extend(["-acodec", "libmp3lame", "-q:a", "2"].map(String::from));
            }
            _ => args.extend(["-acodec", "copy"].map(String::from)),
        }
        args.push("-metadata".into());
        args.push(match self.mode {
            CaptureMode::Segmented => station_tag(&self.station),
            CaptureMode::Manual { .. } => manual_station_tag(&self.station),
        });
        match self.mode {
            CaptureMode::Segmented => {
                args.extend(["-f", "segment", "-segment_time"].map(String::from));
                args.push(segment_seconds.to_string());
                args.extend(
                    [
                        "-reset_timestamps",
                        "1",
                        "-segment_atclocktime",
                        "1",
                        "-strftime",
                        "1",
                    ]
                    .map(String::from),
                );
            }
            CaptureMode::Manual { duration, .. } => {
                args.push("-t".into());
                args.push(duration.as_secs().to_string());
            }
        }
        args.push(self.output().to_string_lossy().into_owned());
        args
    }
}

/// Starts and stops capture processes.
pub trait CaptureLauncher: Send + Sync {
    /// Spawn detached; returns the OS pid. Does not wait for the process.
    fn launch(&self, job: &CaptureJob) -> Result<u32>;
    /// One-shot termination signal.
    fn terminate(&self, pid: u32) -> Result<()>;
    /// Capture binary in use, if one was found.
    fn binary(&self) -> Option<&Path>;
}

/// First line of `ffmpeg -version`, bounded by `timeout`.
pub async fn binary_version(binary: &Path, timeout: Duration) -> Result<String> {
    let run = tokio::process::Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| RecorderError::ProcessControl(format!("{} -version timed out", binary.display())))?
        .map_err(|e| RecorderError::ProcessControl(format!("{} -version: {e}", binary.display())))?;
    if !output.status.success() {
        return Err(RecorderError::ProcessControl(format!(
            "{} -version exited with {:?}",
            binary.display(),
            output.status.code()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

pub struct FfmpegLauncher {
    ffmpeg: Option<PathBuf>,
    segment_seconds: u64,
    timezone: Option<String>,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg: Option<PathBuf>, config: &CaptureConfig) -> Self {
        Self {
            ffmpeg,
            segment_seconds: config.segment_seconds,
            timezone: config.timezone.clone(),
        }
    }
}

impl CaptureLauncher for FfmpegLauncher {
    fn launch(&self, job: &CaptureJob) -> Result<u32> {
        let ffmpeg = self
            .ffmpeg
            .as_ref()
            .ok_or_else(|| RecorderError::ProcessControl("ffmpeg binary not found".into()))?;

        std::fs::create_dir_all(&job.dir).map_err(|e| {
            RecorderError::ProcessControl(format!("cannot create {}: {e}", job.dir.display()))
        })?;

        let args = job.args(self.segment_seconds);
        debug!("[launcher] {} {}", ffmpeg.display(), args.join(" "));

        let mut cmd = tokio::process::Command::new(ffmpeg);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if let Some(tz) = &self.timezone {
            cmd.env("TZ", tz);
        }
        // own process group: a Ctrl-C aimed at the daemon must not end recordings
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            RecorderError::ProcessControl(format!("spawn failed for {}: {e}", job.station))
        })?;
        let pid = child.id().ok_or_else(|| {
            RecorderError::ProcessControl(format!(
                "capture for {} exited before its pid could be read",
                job.station
            ))
        })?;
        info!(
            "[launcher] capture started for {} (output: {}), PID: {}",
            job.station,
            job.output().display(),
            pid
        );
        // dropping the handle detaches; tokio reaps the child when it exits
        drop(child);
        Ok(pid)
    }

    fn binary(&self) -> Option<&Path> {
        self.ffmpeg.as_deref()
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let process = sys
            .process(target)
            .ok_or_else(|| RecorderError::ProcessControl(format!("PID {pid} is not running")))?;

        match process.kill_with(Signal::Term) {
            Some(true) => Ok(()),
            Some(false) => Err(RecorderError::ProcessControl(format!(
                "failed to signal PID {pid}"
            ))),
            None => {
                warn!("[launcher] SIGTERM unsupported here, killing PID {}", pid);
                if process.kill() {
                    Ok(())
                } else {
                    Err(RecorderError::ProcessControl(format!("failed to kill PID {pid}")))
                }
            }
        }
    }
}
