use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Where recordings and the station database live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of `{station}/{date}/{hour}.{ext}` segment trees.
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Explicit ffmpeg location. Falls back to `FFMPEG_PATH`, then beside
    /// the executable, then `PATH`.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
    #[serde(default = "default_manual_seconds")]
    pub manual_seconds: u64,
    /// IANA zone that dates and hours are named in. Also handed to capture
    /// processes as `TZ` so `%H` segment names agree. Host zone when unset.
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_min_free_gib")]
    pub min_free_gib: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Bytes read from a stream before the reachability probe hangs up.
    #[serde(default = "default_read_cap_bytes")]
    pub read_cap_bytes: usize,
    /// Seconds of audio the decode probe asks ffmpeg for.
    #[serde(default = "default_probe_seconds")]
    pub probe_seconds: u64,
    /// Hard wall-clock limit on the decode probe process.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Seconds past the top of the hour at which a tick fires.
    #[serde(default = "default_offset_secs")]
    pub offset_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            database: default_database(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            extension: default_extension(),
            segment_seconds: default_segment_seconds(),
            manual_seconds: default_manual_seconds(),
            timezone: None,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_free_gib: default_min_free_gib(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_cap_bytes: default_read_cap_bytes(),
            probe_seconds: default_probe_seconds(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            offset_secs: default_offset_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl ResolverConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_recordings_dir() -> PathBuf {
    platform::data_dir().join("recordings")
}

fn default_database() -> PathBuf {
    platform::data_dir().join("stations.db")
}

fn default_extension() -> String {
    "mp3".to_string()
}

fn default_segment_seconds() -> u64 {
    3600
}

fn default_manual_seconds() -> u64 {
    3600
}

fn default_min_free_gib() -> f64 {
    2.0
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; RadioLogger/1.0)".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    8
}

fn default_read_cap_bytes() -> usize {
    64 * 1024
}

fn default_probe_seconds() -> u64 {
    2
}

fn default_probe_timeout_secs() -> u64 {
    15
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_offset_secs() -> u64 {
    1
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8970
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8970);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.disk.min_free_gib, 2.0);
        assert_eq!(config.capture.segment_seconds, 3600);
        assert_eq!(config.resolver.read_cap_bytes, 65536);
        assert!(config.paths.recordings_dir.ends_with("recordings"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [disk]
            min_free_gib = 5.5

            [capture]
            timezone = "Europe/Amsterdam"
            "#,
        )
        .unwrap();
        assert_eq!(config.disk.min_free_gib, 5.5);
        assert_eq!(config.capture.timezone.as_deref(), Some("Europe/Amsterdam"));
        assert_eq!(config.capture.extension, "mp3");
        assert_eq!(config.resolver.probe_seconds, 2);
    }

    #[test]
    fn load_writes_defaults_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.scheduler.offset_secs, 1);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.http.port, config.http.port);
    }
}
