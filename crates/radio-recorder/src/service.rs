use std::sync::Arc;

use radio_core::reconciler::TickReport;
use radio_core::resolver::StreamResolver;
use radio_core::{Recorder, Result};
use tokio::sync::RwLock;

use crate::logging::LogTally;

/// Recorder shared between the scheduler and the HTTP API.
pub struct Service<R> {
    pub recorder: Recorder<R>,
    pub tally: Arc<LogTally>,
    last_tick: RwLock<Option<TickReport>>,
}

impl<R: StreamResolver> Service<R> {
    pub fn new(recorder: Recorder<R>, tally: Arc<LogTally>) -> Self {
        Self {
            recorder,
            tally,
            last_tick: RwLock::new(None),
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let report = self.recorder.tick().await?;
        *self.last_tick.write().await = Some(report.clone());
        Ok(report)
    }

    pub async fn last_tick(&self) -> Option<TickReport> {
        self.last_tick.read().await.clone()
    }
}
