//! Runtime configuration.
//!
//! Supports loading configuration from:
//! 1. A YAML file (default `~/.qmio/config.yaml`)
//! 2. Environment variables (with `QMIO_` prefix)
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use qmio_sched::{RetryPolicy, WaitPolicy, parse_time_limit};
use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::tunnel::Endpoint;

/// Largest accepted poll interval, in seconds.
const MAX_POLL_INTERVAL_SECS: f64 = 3600.0;
/// Largest accepted poll interval growth factor.
const MAX_POLL_BACKOFF: f64 = 10.0;

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Backend used when a request names none.
    #[serde(default = "default_backend")]
    pub default_backend: String,

    /// Shots used when a request gives none.
    #[serde(default = "default_shots")]
    pub default_shots: u32,

    /// Directory holding `<backend>/<action>.sh` executables.
    #[serde(default = "default_backend_prefix")]
    pub backend_prefix: PathBuf,

    /// Directory for materialized circuits, default artifacts and job logs.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Default artifact file names, relative to `work_dir`.
    #[serde(default)]
    pub paths: ArtifactPaths,

    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Polling and retry settings.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Hardware tunnel settings.
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Default artifact paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    /// Results artifact.
    #[serde(default = "default_results_path")]
    pub results: PathBuf,
    /// Execution metrics artifact.
    #[serde(default = "default_metrics_path")]
    pub metrics: PathBuf,
    /// Compiled instructions artifact.
    #[serde(default = "default_instructions_path")]
    pub instructions: PathBuf,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Account jobs are billed to.
    #[serde(default)]
    pub account: Option<String>,
    /// Modules loaded by every job script.
    #[serde(default)]
    pub modules: Vec<String>,
}

/// Polling and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between the first polls, in seconds.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: f64,
    /// Upper bound on the delay between polls, in seconds.
    #[serde(default = "default_max_poll_interval")]
    pub max_interval_secs: f64,
    /// Growth factor of the poll delay.
    #[serde(default = "default_poll_backoff")]
    pub backoff: f64,
    /// Wait budget per job, in seconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    /// Retries of a failing scheduler call.
    #[serde(default = "default_query_retries")]
    pub query_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// How the hardware endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// A scheduler job holds a forwarding rule open.
    #[default]
    Scheduler,
    /// The endpoint is directly routable.
    Direct,
}

/// Hardware tunnel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Hardware-side endpoint, e.g. `tcp://10.5.7.1:5556`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Reachability mechanism.
    #[serde(default)]
    pub mode: TunnelMode,
    /// Script run by the tunnel job: `<forwarder> <port> <endpoint> <hold_secs>`.
    #[serde(default = "default_forwarder")]
    pub forwarder: PathBuf,
    /// Partition of the tunnel job.
    #[serde(default = "default_tunnel_partition")]
    pub partition: String,
    /// Tunnel job time limit, `HH:MM:SS`.
    #[serde(default = "default_tunnel_time_limit")]
    pub time_limit: String,
    /// Largest accepted tunnel time limit, `HH:MM:SS`.
    #[serde(default = "default_max_tunnel_time_limit")]
    pub max_time_limit: String,
    /// Reservation for tunnel and hardware jobs.
    #[serde(default)]
    pub reservation: Option<String>,
    /// How long to wait for the tunnel job to start, in seconds.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    /// Seconds subtracted from the time limit to get the forwarding hold time.
    #[serde(default = "default_setup_overhead")]
    pub setup_overhead_secs: u64,
    /// Lowest local port handed out.
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    /// Highest local port handed out.
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Check that the tunnel address accepts connections before running.
    #[serde(default)]
    pub verify_connection: bool,
    /// Connection check timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

// Default value functions
fn default_backend() -> String {
    qmio_hal::SIMULATOR_RTCS.to_string()
}

fn default_shots() -> u32 {
    100
}

fn default_backend_prefix() -> PathBuf {
    PathBuf::from("/mnt/Q_SWAP/qmio/backends")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results.json")
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("execution_metrics.json")
}

fn default_instructions_path() -> PathBuf {
    PathBuf::from("instructions.p")
}

fn default_poll_interval() -> f64 {
    2.0
}

fn default_max_poll_interval() -> f64 {
    30.0
}

fn default_poll_backoff() -> f64 {
    1.5
}

fn default_wait_timeout() -> u64 {
    3600 // 1 hour
}

fn default_query_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_forwarder() -> PathBuf {
    PathBuf::from("/mnt/Q_SWAP/qmio/slurm_scripts/qpu.sh")
}

fn default_tunnel_partition() -> String {
    "qpu".to_string()
}

fn default_tunnel_time_limit() -> String {
    "00:10:00".to_string()
}

fn default_max_tunnel_time_limit() -> String {
    "08:00:00".to_string()
}

fn default_start_timeout() -> u64 {
    600
}

fn default_setup_overhead() -> u64 {
    30
}

fn default_port_min() -> u16 {
    600
}

fn default_port_max() -> u16 {
    699
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            results: default_results_path(),
            metrics: default_metrics_path(),
            instructions: default_instructions_path(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            max_interval_secs: default_max_poll_interval(),
            backoff: default_poll_backoff(),
            wait_timeout_secs: default_wait_timeout(),
            query_retries: default_query_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            mode: TunnelMode::default(),
            forwarder: default_forwarder(),
            partition: default_tunnel_partition(),
            time_limit: default_tunnel_time_limit(),
            max_time_limit: default_max_tunnel_time_limit(),
            reservation: None,
            start_timeout_secs: default_start_timeout(),
            setup_overhead_secs: default_setup_overhead(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            verify_connection: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            default_shots: default_shots(),
            backend_prefix: default_backend_prefix(),
            work_dir: default_work_dir(),
            paths: ArtifactPaths::default(),
            scheduler: SchedulerSettings::default(),
            polling: PollingConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> RuntimeResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;

        let config: RuntimeConfig = serde_yaml_ng::from_str(&contents)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    /// Default configuration file, `~/.qmio/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".qmio").join("config.yaml"))
    }

    /// Load configuration with the following precedence:
    /// 1. Load from `config_file`, or the default file if it exists
    /// 2. Apply environment variable overrides
    pub fn load(config_file: Option<&Path>) -> RuntimeResult<Self> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };

        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge `QMIO_*` environment variables into this configuration.
    pub fn merge_env(self) -> Self {
        self.merge_env_from(|key| std::env::var(key).ok())
    }

    /// Merge variables from `lookup`. Only variables that are set override
    /// the current values; unparsable numbers are ignored.
    pub fn merge_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("QMIO_ENDPOINT") {
            self.tunnel.endpoint = Some(v);
        }
        if let Some(v) = lookup("QMIO_TUNNEL_TIME_LIMIT") {
            self.tunnel.time_limit = v;
        }
        if let Some(v) = lookup("QMIO_RESERVATION") {
            self.tunnel.reservation = Some(v);
        }
        if let Some(v) = lookup("QMIO_TUNNEL_MODE") {
            match v.to_ascii_lowercase().as_str() {
                "direct" => self.tunnel.mode = TunnelMode::Direct,
                "scheduler" => self.tunnel.mode = TunnelMode::Scheduler,
                _ => {}
            }
        }
        if let Some(v) = lookup("QMIO_VERIFY_CONNECTION") {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.tunnel.verify_connection = true,
                "0" | "false" | "no" => self.tunnel.verify_connection = false,
                _ => {}
            }
        }
        if let Some(v) = lookup("QMIO_BACKEND_PREFIX") {
            self.backend_prefix = PathBuf::from(v);
        }
        if let Some(v) = lookup("QMIO_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QMIO_DEFAULT_BACKEND") {
            self.default_backend = v;
        }
        if let Some(v) = lookup("QMIO_DEFAULT_SHOTS") {
            if let Ok(val) = v.parse() {
                self.default_shots = val;
            }
        }
        if let Some(v) = lookup("QMIO_POLL_INTERVAL") {
            if let Ok(val) = v.parse() {
                self.polling.interval_secs = val;
            }
        }
        if let Some(v) = lookup("QMIO_WAIT_TIMEOUT") {
            if let Ok(val) = v.parse() {
                self.polling.wait_timeout_secs = val;
            }
        }

        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.default_backend.is_empty() {
            return Err(RuntimeError::Config("default_backend must not be empty".into()));
        }
        if self.default_shots == 0 {
            return Err(RuntimeError::Config(
                "default_shots must be greater than 0".into(),
            ));
        }

        let polling = &self.polling;
        if !(polling.interval_secs > 0.0 && polling.interval_secs <= MAX_POLL_INTERVAL_SECS) {
            return Err(RuntimeError::Config(format!(
                "Invalid poll interval: {}",
                polling.interval_secs
            )));
        }
        if !(polling.max_interval_secs >= polling.interval_secs
            && polling.max_interval_secs <= MAX_POLL_INTERVAL_SECS)
        {
            return Err(RuntimeError::Config(format!(
                "max_interval_secs must be between interval_secs and {MAX_POLL_INTERVAL_SECS}"
            )));
        }
        if !(polling.backoff >= 1.0 && polling.backoff <= MAX_POLL_BACKOFF) {
            return Err(RuntimeError::Config(format!(
                "Invalid poll backoff: {}",
                polling.backoff
            )));
        }
        if polling.wait_timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "wait_timeout_secs must be greater than 0".into(),
            ));
        }

        let tunnel = &self.tunnel;
        if let Some(ref endpoint) = tunnel.endpoint {
            endpoint.parse::<Endpoint>()?;
        }
        self.tunnel_time_limit()?;
        if tunnel.port_min == 0 || tunnel.port_min > tunnel.port_max {
            return Err(RuntimeError::Config(format!(
                "Invalid tunnel port range {}-{}",
                tunnel.port_min, tunnel.port_max
            )));
        }
        if tunnel.start_timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "start_timeout_secs must be greater than 0".into(),
            ));
        }
        if tunnel.connect_timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Tunnel time limit, checked against the configured maximum.
    pub fn tunnel_time_limit(&self) -> RuntimeResult<Duration> {
        let limit = parse_time_limit(&self.tunnel.time_limit)?;
        let max = parse_time_limit(&self.tunnel.max_time_limit)?;
        if limit > max {
            return Err(RuntimeError::Config(format!(
                "Time limit provided '{}' is outside of the maximum time limit '{}'",
                self.tunnel.time_limit, self.tunnel.max_time_limit
            )));
        }
        if limit.is_zero() {
            return Err(RuntimeError::Config("tunnel time limit must be positive".into()));
        }
        Ok(limit)
    }

    /// Parsed tunnel endpoint, if configured.
    pub fn endpoint(&self) -> RuntimeResult<Option<Endpoint>> {
        self.tunnel
            .endpoint
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Wait policy for backend jobs.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            interval: Duration::from_secs_f64(self.polling.interval_secs),
            max_interval: Duration::from_secs_f64(self.polling.max_interval_secs),
            backoff: self.polling.backoff,
            timeout: Duration::from_secs(self.polling.wait_timeout_secs),
        }
    }

    /// Retry policy for scheduler calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.polling.query_retries,
            Duration::from_millis(self.polling.retry_delay_ms),
        )
    }

    /// Resolve an artifact path against the work directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    /// Directory for scheduler logs.
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join(".qmio").join("logs")
    }

    /// Directory for rendered batch scripts.
    pub fn script_dir(&self) -> PathBuf {
        self.work_dir.join(".qmio").join("scripts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_backend, "simulator_rtcs");
        assert_eq!(config.default_shots, 100);
        assert_eq!(config.paths.results, PathBuf::from("results.json"));
        assert_eq!(config.tunnel.port_min, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_env_overrides() {
        let config = RuntimeConfig::default().merge_env_from(env(&[
            ("QMIO_ENDPOINT", "tcp://10.5.7.1:5556"),
            ("QMIO_DEFAULT_SHOTS", "2048"),
            ("QMIO_WAIT_TIMEOUT", "not-a-number"),
            ("QMIO_TUNNEL_MODE", "direct"),
            ("QMIO_VERIFY_CONNECTION", "true"),
        ]));
        assert!(config.tunnel.verify_connection);
        assert_eq!(config.tunnel.endpoint.as_deref(), Some("tcp://10.5.7.1:5556"));
        assert_eq!(config.default_shots, 2048);
        assert_eq!(config.polling.wait_timeout_secs, 3600);
        assert_eq!(config.tunnel.mode, TunnelMode::Direct);
        assert_eq!(config.endpoint().unwrap().unwrap().port, 5556);
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "default_backend: simulator_qulacs\npolling:\n  wait_timeout_secs: 120\ntunnel:\n  reservation: qpu_res\n",
        )
        .unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.default_backend, "simulator_qulacs");
        assert_eq!(config.polling.wait_timeout_secs, 120);
        assert_eq!(config.polling.interval_secs, 2.0);
        assert_eq!(config.tunnel.reservation.as_deref(), Some("qpu_res"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "default_shots: 500\n").unwrap();

        let config = RuntimeConfig::from_file(&path)
            .unwrap()
            .merge_env_from(env(&[("QMIO_DEFAULT_SHOTS", "7")]));
        assert_eq!(config.default_shots, 7);
    }

    #[test]
    fn test_validate_rejects_zero_shots() {
        let mut config = RuntimeConfig::default();
        config.default_shots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_extreme_polling() {
        let mut config = RuntimeConfig::default();
        config.polling.backoff = 1e300;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.polling.max_interval_secs = 1e300;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.polling.interval_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.polling.interval_secs = 3600.0;
        config.polling.max_interval_secs = 3600.0;
        config.polling.backoff = 10.0;
        assert!(config.validate().is_ok());
        let wait = config.wait_policy();
        assert_eq!(wait.max_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let mut config = RuntimeConfig::default();
        config.tunnel.endpoint = Some("10.5.7.1".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tunnel_time_limit_bounds() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.tunnel_time_limit().unwrap(), Duration::from_secs(600));

        config.tunnel.time_limit = "09:00:00".into();
        let err = config.tunnel_time_limit().unwrap_err();
        assert!(err.to_string().contains("outside of the maximum"));

        config.tunnel.time_limit = "10 minutes".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = RuntimeConfig::default();
        config.work_dir = PathBuf::from("/scratch/me");
        assert_eq!(
            config.resolve(Path::new("results.json")),
            PathBuf::from("/scratch/me/results.json")
        );
        assert_eq!(
            config.resolve(Path::new("/tmp/out.json")),
            PathBuf::from("/tmp/out.json")
        );
    }
}
