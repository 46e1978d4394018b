//! Station definitions and the per-tick desired recording state.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};

/// Half-open recording window `[start, end)` at hour granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Free-text note from the operator ("election night", ...).
    #[serde(default)]
    pub reason: Option<String>,
}

impl Schedule {
    /// Build a window from the date + hour pairs an admin form submits.
    pub fn from_parts(
        start_date: NaiveDate,
        start_hour: u32,
        end_date: NaiveDate,
        end_hour: u32,
        reason: Option<String>,
    ) -> Result<Self> {
        let start = at_hour(start_date, start_hour)?;
        let end = at_hour(end_date, end_hour)?;
        let schedule = Self { start, end, reason };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end <= self.start {
            return Err(RecorderError::Validation(format!(
                "schedule end {} must be after start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }

    /// `end` is excluded: a tick at exactly `end` must stop the recording.
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }
}

fn at_hour(date: NaiveDate, hour: u32) -> Result<NaiveDateTime> {
    NaiveTime::from_hms_opt(hour, 0, 0)
        .map(|time| date.and_time(time))
        .ok_or_else(|| RecorderError::Validation(format!("hour {hour} is out of range 0-23")))
}

/// Which of the three mutually exclusive station modes applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    AlwaysOn,
    Scheduled,
    Dormant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    On,
    Off,
}

/// Operator input for a new station, before the stream has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationDraft {
    pub name: String,
    pub source_url: String,
    #[serde(default)]
    pub always_on: bool,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

impl StationDraft {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.source_url.trim().is_empty() {
            return Err(RecorderError::Validation("no url given".to_string()));
        }
        if self.always_on && self.schedule.is_some() {
            return Err(RecorderError::Validation(format!(
                "station {} cannot be always-on and scheduled at the same time",
                self.name
            )));
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }

    pub fn into_station(self, resolved_url: String) -> Station {
        Station {
            name: self.name,
            source_url: self.source_url,
            resolved_url,
            always_on: self.always_on,
            schedule: self.schedule,
            created_at: Utc::now(),
        }
    }
}

/// Station names double as directory segments under the recordings root.
fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RecorderError::Validation("station name is empty".to_string()));
    }
    if trimmed != name {
        return Err(RecorderError::Validation(format!(
            "station name {name:?} has leading or trailing whitespace"
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(RecorderError::Validation(format!(
            "station name {name:?} is not usable as a directory name"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    /// URL as the operator typed it; may be a playlist.
    pub source_url: String,
    /// Direct stream the resolver validated when the station was created.
    pub resolved_url: String,
    pub always_on: bool,
    pub schedule: Option<Schedule>,
    pub created_at: DateTime<Utc>,
}

impl Station {
    pub fn activity(&self) -> Activity {
        if self.always_on {
            Activity::AlwaysOn
        } else if self.schedule.is_some() {
            Activity::Scheduled
        } else {
            Activity::Dormant
        }
    }

    pub fn desired_state(&self, now: NaiveDateTime) -> DesiredState {
        let on = match self.activity() {
            Activity::AlwaysOn => true,
            Activity::Scheduled => self.schedule.as_ref().is_some_and(|s| s.contains(now)),
            Activity::Dormant => false,
        };
        if on {
            DesiredState::On
        } else {
            DesiredState::Off
        }
    }

    /// URLs that identify this station's capture processes on the command line.
    pub fn match_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source_url.as_str())
            .chain((self.resolved_url != self.source_url).then_some(self.resolved_url.as_str()))
            .filter(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn scheduled(start: &str, end: &str) -> Station {
        StationDraft {
            name: "Radio X".into(),
            source_url: "http://example.com/live".into(),
            always_on: false,
            schedule: Some(Schedule {
                start: dt(start),
                end: dt(end),
                reason: None,
            }),
        }
        .into_station("http://example.com/live".into())
    }

    #[test]
    fn schedule_window_is_half_open() {
        let s = scheduled("2024-05-01 10:00:00", "2024-05-01 12:00:00");
        assert_eq!(s.desired_state(dt("2024-05-01 09:59:59")), DesiredState::Off);
        assert_eq!(s.desired_state(dt("2024-05-01 10:00:00")), DesiredState::On);
        assert_eq!(s.desired_state(dt("2024-05-01 11:59:59")), DesiredState::On);
        assert_eq!(s.desired_state(dt("2024-05-01 12:00:00")), DesiredState::Off);
    }

    #[test]
    fn always_on_ignores_clock() {
        let mut s = scheduled("2024-05-01 10:00:00", "2024-05-01 12:00:00");
        s.schedule = None;
        s.always_on = true;
        assert_eq!(s.activity(), Activity::AlwaysOn);
        assert_eq!(s.desired_state(dt("1999-01-01 03:00:00")), DesiredState::On);
    }

    #[test]
    fn dormant_station_is_off() {
        let mut s = scheduled("2024-05-01 10:00:00", "2024-05-01 12:00:00");
        s.schedule = None;
        assert_eq!(s.activity(), Activity::Dormant);
        assert_eq!(s.desired_state(dt("2024-05-01 11:00:00")), DesiredState::Off);
    }

    #[test]
    fn from_parts_rejects_bad_hours_and_inverted_windows() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(Schedule::from_parts(d, 24, d, 1, None).is_err());
        assert!(Schedule::from_parts(d, 12, d, 10, None).is_err());
        assert!(Schedule::from_parts(d, 12, d, 12, None).is_err());
        let ok = Schedule::from_parts(d, 22, d.succ_opt().unwrap(), 2, Some("night".into())).unwrap();
        assert_eq!(ok.start, dt("2024-05-01 22:00:00"));
        assert_eq!(ok.end, dt("2024-05-02 02:00:00"));
    }

    #[test]
    fn draft_validation() {
        let mut draft = StationDraft {
            name: "Radio X".into(),
            source_url: "http://example.com/live".into(),
            always_on: true,
            schedule: None,
        };
        assert!(draft.validate().is_ok());

        draft.schedule = Some(Schedule {
            start: dt("2024-05-01 10:00:00"),
            end: dt("2024-05-01 12:00:00"),
            reason: None,
        });
        assert!(matches!(draft.validate(), Err(RecorderError::Validation(_))));

        draft.schedule = None;
        for bad in ["", " Radio", "a/b", "..", "x\\y"] {
            draft.name = bad.into();
            assert!(draft.validate().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn match_urls_skips_duplicates() {
        let s = scheduled("2024-05-01 10:00:00", "2024-05-01 12:00:00");
        assert_eq!(s.match_urls().collect::<Vec<_>>(), vec!["http://example.com/live"]);

        let mut s2 = s.clone();
        s2.source_url = "http://example.com/live.pls".into();
        assert_eq!(
            s2.match_urls().collect::<Vec<_>>(),
            vec!["http://example.com/live.pls", "http://example.com/live"]
        );
    }
}
