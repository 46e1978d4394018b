use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use radio_core::resolver::StreamResolver;
use tracing::{debug, error, info};

use crate::service::Service;

const HOUR: Duration = Duration::from_secs(3600);

/// Time from `now` until `offset` past the next clock hour.
///
/// Works on minutes and seconds only, so DST jumps do not shift the firing point.
pub fn until_next_fire(now: NaiveTime, offset: Duration) -> Duration {
    let offset = offset.min(HOUR - Duration::from_secs(1));
    let into_hour = Duration::from_secs(u64::from(now.minute() * 60 + now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000));
    if into_hour < offset {
        offset - into_hour
    } else {
        HOUR - into_hour + offset
    }
}

/// Tick once immediately, then every hour at `offset` past the hour.
pub async fn run<R: StreamResolver>(service: Arc<Service<R>>, offset: Duration) {
    info!("Scheduler started, ticking at {}s past each hour", offset.as_secs());
    loop {
        match service.tick().await {
            Ok(report) => debug!("Scheduled tick covered {} station(s)", report.stations.len()),
            Err(e) => error!("Scheduled tick failed: {}", e),
        }
        let wait = until_next_fire(service.recorder.settings().now().time(), offset);
        debug!("Next tick in {:.1}s", wait.as_secs_f64());
        tokio::time::sleep(wait).await;
    }
}
