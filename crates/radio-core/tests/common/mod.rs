#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use radio_core::disk::DiskGuard;
use radio_core::error::{RecorderError, ResolveError, Result};
use radio_core::inventory::{CaptureProcess, ProcessInventory};
use radio_core::launcher::{CaptureJob, CaptureLauncher};
use radio_core::resolver::StreamResolver;
use radio_core::station::{Schedule, Station, StationDraft};
use radio_core::store::{SqliteStore, StationStore};
use radio_core::{Recorder, RecorderSettings};

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}

/// Process table shared by the fake launcher and the fake inventory.
#[derive(Default)]
pub struct ProcessTable {
    procs: Mutex<Vec<CaptureProcess>>,
    next_pid: AtomicU64,
}

impl ProcessTable {
    pub fn insert(&self, args: Vec<String>) -> u32 {
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        self.procs.lock().unwrap().push(CaptureProcess::new(pid, args));
        pid
    }

    pub fn remove(&self, pid: u32) -> bool {
        let mut procs = self.procs.lock().unwrap();
        let before = procs.len();
        procs.retain(|p| p.pid != pid);
        procs.len() != before
    }

    pub fn pids(&self) -> Vec<u32> {
        self.procs.lock().unwrap().iter().map(|p| p.pid).collect()
    }

    pub fn for_station(&self, name: &str) -> Vec<CaptureProcess> {
        self.procs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.tagged_station() == Some(name))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.procs.lock().unwrap().len()
    }
}

pub struct FakeInventory(pub Arc<ProcessTable>);

impl ProcessInventory for FakeInventory {
    fn snapshot(&self) -> Vec<CaptureProcess> {
        let mut procs = self.0.procs.lock().unwrap().clone();
        procs.sort_by_key(|p| p.pid);
        procs
    }
}

pub struct FakeLauncher {
    pub table: Arc<ProcessTable>,
    pub launched: Mutex<Vec<CaptureJob>>,
    pub unkillable: Mutex<HashSet<u32>>,
}

impl FakeLauncher {
    pub fn new(table: Arc<ProcessTable>) -> Self {
        Self {
            table,
            launched: Mutex::new(Vec::new()),
            unkillable: Mutex::new(HashSet::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

impl CaptureLauncher for FakeLauncher {
    fn launch(&self, job: &CaptureJob) -> Result<u32> {
        let mut args = vec!["ffmpeg".to_string()];
        args.extend(job.args(3600));
        let pid = self.table.insert(args);
        self.launched.lock().unwrap().push(job.clone());
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        if self.unkillable.lock().unwrap().contains(&pid) {
            return Err(RecorderError::ProcessControl(format!("PID {pid} refused to die")));
        }
        if self.table.remove(pid) {
            Ok(())
        } else {
            Err(RecorderError::ProcessControl(format!("PID {pid} is not running")))
        }
    }

    fn binary(&self) -> Option<&Path> {
        None
    }
}

pub struct FakeDisk {
    pub free: AtomicU64,
}

impl FakeDisk {
    pub fn with_gib(gib: f64) -> Self {
        Self {
            free: AtomicU64::new((gib * GIB as f64) as u64),
        }
    }

    pub fn set_gib(&self, gib: f64) {
        self.free.store((gib * GIB as f64) as u64, Ordering::SeqCst);
    }
}

impl DiskGuard for FakeDisk {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }
}

/// Echoes URLs back unless told otherwise.
#[derive(Default)]
pub struct FakeResolver {
    pub answers: Mutex<HashMap<String, std::result::Result<String, ResolveError>>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn fail(&self, url: &str) {
        self.answers.lock().unwrap().insert(
            url.to_string(),
            Err(ResolveError::NoWorkingStream {
                url: url.to_string(),
            }),
        );
    }

    pub fn answer(&self, url: &str, resolved: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(resolved.to_string()));
    }
}

impl StreamResolver for FakeResolver {
    async fn resolve(&self, url: &str) -> std::result::Result<String, ResolveError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.answers
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Ok(url.to_string()))
    }
}

pub struct Harness {
    pub recorder: Recorder<Arc<FakeResolver>>,
    pub store: Arc<SqliteStore>,
    pub table: Arc<ProcessTable>,
    pub launcher: Arc<FakeLauncher>,
    pub disk: Arc<FakeDisk>,
    pub resolver: Arc<FakeResolver>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let table = Arc::new(ProcessTable::default());
        let launcher = Arc::new(FakeLauncher::new(table.clone()));
        let disk = Arc::new(FakeDisk::with_gib(50.0));
        let resolver = Arc::new(FakeResolver::default());
        let settings = RecorderSettings {
            recordings_dir: "/rec".into(),
            extension: "mp3".into(),
            min_free_gib: 2.0,
            manual_duration: Duration::from_secs(3600),
            timezone: None,
        };
        let recorder = Recorder::new(
            store.clone(),
            resolver.clone(),
            Arc::new(FakeInventory(table.clone())),
            launcher.clone(),
            disk.clone(),
            settings,
        );
        Self {
            recorder,
            store,
            table,
            launcher,
            disk,
            resolver,
        }
    }

    pub fn add_always_on(&self, name: &str) -> Station {
        self.insert(StationDraft {
            name: name.into(),
            source_url: format!("http://{name}.example/live"),
            always_on: true,
            schedule: None,
        })
    }

    pub fn add_scheduled(&self, name: &str, start: &str, end: &str) -> Station {
        self.insert(StationDraft {
            name: name.into(),
            source_url: format!("http://{name}.example/live"),
            always_on: false,
            schedule: Some(Schedule {
                start: dt(start),
                end: dt(end),
                reason: None,
            }),
        })
    }

    pub fn add_dormant(&self, name: &str) -> Station {
        self.insert(StationDraft {
            name: name.into(),
            source_url: format!("http://{name}.example/live"),
            always_on: false,
            schedule: None,
        })
    }

    fn insert(&self, draft: StationDraft) -> Station {
        let url = draft.source_url.clone();
        let station = draft.into_station(url);
        self.store.create(&station).unwrap();
        station
    }
}
