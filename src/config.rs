use std::path::PathBuf;

use chrono::FixedOffset;
use serde::{de, Deserialize, Deserializer};
use snafu::{ensure, ResultExt};

use crate::database::DatabaseConfig;
use crate::error::{ApplicationError, ConfigLoadSnafu, OverlappingSlotsSnafu};
use crate::pipeline::StatsConfig;
use crate::push::WebPushConfig;
use crate::scheduler::SchedulerConfig;
use crate::youtube::YouTubeConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub youtube: YouTubeConfig,
    pub push: WebPushConfig,
    pub stats: StatsConfig,
    pub schedule: SchedulerConfig,
    pub log_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Logging {
    #[serde(default = "default_log_dir")]
    log_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// Read every configuration group from the environment.
///
/// | group    | prefix      |
/// |----------|-------------|
/// | database | `SURREAL_`  |
/// | youtube  | `YOUTUBE_`  |
/// | push     | `PUSH_`     |
/// | stats    | `STATS_`    |
/// | schedule | `SCHEDULE_` |
pub fn load() -> Result<Config, ApplicationError> {
    Ok(Config {
        database: prefixed("SURREAL_", "database")?,
        youtube: prefixed("YOUTUBE_", "youtube")?,
        push: prefixed("PUSH_", "push")?,
        stats: prefixed("STATS_", "stats")?,
        schedule: schedule(prefixed("SCHEDULE_", "schedule")?)?,
        log_dir: envy::from_env::<Logging>()
            .context(ConfigLoadSnafu { group: "logging" })?
            .log_dir,
    })
}

fn prefixed<T>(prefix: &str, group: &'static str) -> Result<T, ApplicationError>
where
    T: de::DeserializeOwned,
{
    envy::prefixed(prefix)
        .from_env()
        .context(ConfigLoadSnafu { group })
}

/// Song and talent refreshes must never hit the provider in the same slot.
fn schedule(config: SchedulerConfig) -> Result<SchedulerConfig, ApplicationError> {
    let hours = config.shared_update_hours();
    ensure!(hours.is_empty(), OverlappingSlotsSnafu { hours });

    Ok(config)
}

/// Human readable durations such as `10s` or `90days`.
pub mod duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}

/// Whole hours east of UTC, e.g. `9` for Japan.
pub fn utc_offset<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FixedOffset, D::Error> {
    let hours = i32::deserialize(deserializer)?;

    FixedOffset::east_opt(hours * 3600)
        .ok_or_else(|| de::Error::custom(format!("{hours} is not a valid utc offset")))
}

/// An hour of the day, `0` to `23`.
pub fn hour<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let hour = u32::deserialize(deserializer)?;
    check_hour(hour).map_err(de::Error::custom)
}

/// Hours of the day, comma separated.
pub fn hours<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u32>, D::Error> {
    let hours = Vec::<u32>::deserialize(deserializer)?;
    for hour in &hours {
        check_hour(*hour).map_err(de::Error::custom)?;
    }
    Ok(hours)
}

fn check_hour(hour: u32) -> Result<u32, String> {
    if hour < 24 {
        Ok(hour)
    } else {
        Err(format!("{hour} is not an hour of the day"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn stats_defaults() {
        let stats: StatsConfig = envy::from_iter(env(&[])).unwrap();

        assert_eq!(stats.concurrency, 1);
        assert_eq!(stats.provider_timeout, Duration::from_secs(10));
        assert_eq!(stats.snapshot_bucket, Duration::from_secs(3600));
        assert_eq!(stats.delivery_concurrency, 8);
    }

    #[test]
    fn durations_are_human_readable() {
        let stats: StatsConfig = envy::from_iter(env(&[
            ("PROVIDER_TIMEOUT", "2s 500ms"),
            ("RETENTION", "30days"),
        ]))
        .unwrap();

        assert_eq!(stats.provider_timeout, Duration::from_millis(2500));
        assert_eq!(stats.retention, Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn schedule_from_env() {
        let schedule: SchedulerConfig = envy::from_iter(env(&[
            ("UTC_OFFSET_HOURS", "0"),
            ("SONG_HOURS", "1,13"),
        ]))
        .unwrap();

        assert_eq!(schedule.utc_offset, FixedOffset::east_opt(0).unwrap());
        assert_eq!(schedule.song_hours, [1, 13]);
        assert_eq!(schedule.talent_hours, [2, 10, 18]);
        assert_eq!(schedule.cleanup_hour, 3);
    }

    #[test]
    fn invalid_hours_are_rejected() {
        let result = envy::from_iter::<_, SchedulerConfig>(env(&[("SONG_HOURS", "0,24")]));
        assert!(result.is_err());

        let result = envy::from_iter::<_, SchedulerConfig>(env(&[("UTC_OFFSET_HOURS", "30")]));
        assert!(result.is_err());

        let result = envy::from_iter::<_, SchedulerConfig>(env(&[("CLEANUP_HOUR", "24")]));
        assert!(result.is_err());

        let cleanup: SchedulerConfig = envy::from_iter(env(&[("CLEANUP_HOUR", "23")])).unwrap();
        assert_eq!(cleanup.cleanup_hour, 23);
    }

    #[test]
    fn song_and_talent_slots_must_not_overlap() {
        let shared: SchedulerConfig = envy::from_iter(env(&[
            ("SONG_HOURS", "0,8,16"),
            ("TALENT_HOURS", "8,20"),
        ]))
        .unwrap();

        let error = schedule(shared).unwrap_err();
        assert!(matches!(
            error,
            ApplicationError::OverlappingSlots { ref hours, .. } if hours == &[8]
        ));
        assert!(schedule(SchedulerConfig::default()).is_ok());
    }

    #[test]
    fn database_defaults() {
        let database: DatabaseConfig =
            envy::from_iter(env(&[("URL", "http://localhost:8000")])).unwrap();

        assert!(format!("{database:?}").contains("hoshiyomi"));
    }
}
