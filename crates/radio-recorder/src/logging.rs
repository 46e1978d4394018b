use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const RECENT_PROBLEMS: usize = 20;

/// WARN/ERROR counters surfaced through the status endpoint.
#[derive(Debug, Default)]
pub struct LogTally {
    warnings: AtomicU64,
    errors: AtomicU64,
    recent: Mutex<VecDeque<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TallySnapshot {
    pub warnings: u64,
    pub errors: u64,
    pub recent: Vec<String>,
}

impl LogTally {
    pub fn record(&self, level: tracing::Level, message: String) {
        match level {
            tracing::Level::ERROR => self.errors.fetch_add(1, Ordering::Relaxed),
            _ => self.warnings.fetch_add(1, Ordering::Relaxed),
        };
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() == RECENT_PROBLEMS {
            recent.pop_front();
        }
        recent.push_back(message);
    }

    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            warnings: self.warnings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            recent: self
                .recent
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .cloned()
                .collect(),
        }
    }
}

/// Tracing layer that feeds WARN and ERROR events into a [`LogTally`].
struct TallyLayer {
    tally: Arc<LogTally>,
}

impl<S> tracing_subscriber::Layer<S> for TallyLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = *event.metadata().level();
        if !matches!(level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let now = chrono::Local::now();
        let mut message = format!("{} [{}] ", now.format("%Y-%m-%d %H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        self.tally.record(level, message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// File log in the data dir, plus stderr for one-shot commands.
pub fn init(data_dir: &Path, to_stderr: bool) -> anyhow::Result<Arc<LogTally>> {
    std::fs::create_dir_all(data_dir)?;
    let log_path = data_dir.join("recorder.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let tally = Arc::new(LogTally::default());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(TallyLayer {
            tally: tally.clone(),
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,radio_core=debug,radio_recorder=debug")
            }),
        )
        .init();

    tracing::info!("Log file: {:?}", log_path);
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_counts_and_keeps_recent_problems() {
        let tally = LogTally::default();
        tally.record(tracing::Level::WARN, "low disk".into());
        tally.record(tracing::Level::ERROR, "spawn failed".into());
        for i in 0..RECENT_PROBLEMS {
            tally.record(tracing::Level::WARN, format!("w{i}"));
        }

        let snap = tally.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.warnings as usize, RECENT_PROBLEMS + 1);
        assert_eq!(snap.recent.len(), RECENT_PROBLEMS);
        assert_eq!(snap.recent[0], "w0");
    }
}
