use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::registry::DEFAULT_STALENESS_THRESHOLD;
use crate::registry::DEFAULT_SWEEP_INTERVAL;
use crate::registry::DEFAULT_WATCHDOG_TIMEOUT;
use crate::registry::RegistryTimings;
use crate::registry::STRICT_WATCHDOG_TIMEOUT;
use crate::throttle::DEFAULT_THROTTLE_INTERVAL;

pub const STREAM_CONFIG_RELATIVE_PATH: &str = ".duet/stream.toml";
pub const STREAM_CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPolicy {
    #[default]
    Standard,
    Strict,
}

impl WatchdogPolicy {
    pub fn timeout(self) -> Duration {
        match self {
            Self::Standard => DEFAULT_WATCHDOG_TIMEOUT,
            Self::Strict => STRICT_WATCHDOG_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    #[serde(default = "stream_config_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub watchdog_policy: WatchdogPolicy,
    /// Overrides the policy's timeout when set.
    #[serde(default)]
    pub watchdog_timeout_ms: Option<u64>,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            schema_version: STREAM_CONFIG_SCHEMA_VERSION,
            watchdog_policy: WatchdogPolicy::default(),
            watchdog_timeout_ms: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
            throttle_interval_ms: default_throttle_interval_ms(),
        }
    }
}

impl StreamConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        self.watchdog_timeout_ms
            .map_or_else(|| self.watchdog_policy.timeout(), Duration::from_millis)
    }

    pub fn registry_timings(&self) -> RegistryTimings {
        RegistryTimings {
            watchdog_timeout: self.watchdog_timeout(),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            staleness_threshold: Duration::from_millis(self.staleness_threshold_ms),
        }
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    /// First interval set to zero. A zero sweep period panics the ticker; a
    /// zero threshold or timeout clears every run as soon as it begins.
    fn zero_interval(&self) -> Option<&'static str> {
        [
            ("sweep_interval_ms", Some(self.sweep_interval_ms)),
            ("staleness_threshold_ms", Some(self.staleness_threshold_ms)),
            ("watchdog_timeout_ms", self.watchdog_timeout_ms),
            ("throttle_interval_ms", Some(self.throttle_interval_ms)),
        ]
        .into_iter()
        .find_map(|(field, value)| (value == Some(0)).then_some(field))
    }
}

#[derive(Debug, Error)]
pub enum StreamConfigError {
    #[error("failed to read stream config file `{path}`: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse stream config file `{path}`: {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("unsupported stream config schema version `{found}` in `{path}`; expected `{expected}`")]
    UnsupportedSchemaVersion {
        path: String,
        expected: u32,
        found: u32,
    },
    #[error("`{field}` in `{path}` must be greater than zero")]
    ZeroInterval { path: String, field: &'static str },
}

pub fn stream_config_file_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(STREAM_CONFIG_RELATIVE_PATH)
}

pub fn load_stream_config(
    workspace_root: &Path,
) -> Result<Option<StreamConfig>, StreamConfigError> {
    let config_path = stream_config_file_path(workspace_root);
    let raw_config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StreamConfigError::ReadFailed {
                path: config_path.to_string_lossy().to_string(),
                source,
            });
        }
    };

    let config: StreamConfig =
        toml::from_str(&raw_config).map_err(|source| StreamConfigError::ParseFailed {
            path: config_path.to_string_lossy().to_string(),
            source,
        })?;

    if config.schema_version != STREAM_CONFIG_SCHEMA_VERSION {
        return Err(StreamConfigError::UnsupportedSchemaVersion {
            path: config_path.to_string_lossy().to_string(),
            expected: STREAM_CONFIG_SCHEMA_VERSION,
            found: config.schema_version,
        });
    }

    if let Some(field) = config.zero_interval() {
        return Err(StreamConfigError::ZeroInterval {
            path: config_path.to_string_lossy().to_string(),
            field,
        });
    }

    Ok(Some(config))
}

/// The config file under `workspace_root`, or defaults when it is absent.
pub fn resolve_stream_config(workspace_root: &Path) -> Result<StreamConfig, StreamConfigError> {
    Ok(load_stream_config(workspace_root)?.unwrap_or_default())
}

fn stream_config_schema_version() -> u32 {
    STREAM_CONFIG_SCHEMA_VERSION
}

fn default_sweep_interval_ms() -> u64 {
    duration_ms(DEFAULT_SWEEP_INTERVAL)
}

fn default_staleness_threshold_ms() -> u64 {
    duration_ms(DEFAULT_STALENESS_THRESHOLD)
}

fn default_throttle_interval_ms() -> u64 {
    duration_ms(DEFAULT_THROTTLE_INTERVAL)
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::STREAM_CONFIG_RELATIVE_PATH;
    use super::STREAM_CONFIG_SCHEMA_VERSION;
    use super::StreamConfig;
    use super::StreamConfigError;
    use super::WatchdogPolicy;
    use super::load_stream_config;
    use super::resolve_stream_config;

    fn write_stream_config_file(workspace: &TempDir, contents: &str) -> anyhow::Result<()> {
        let config_path = workspace.path().join(STREAM_CONFIG_RELATIVE_PATH);
        let Some(parent) = config_path.parent() else {
            anyhow::bail!("expected config path to have a parent");
        };
        std::fs::create_dir_all(parent)?;
        std::fs::write(config_path, contents)?;
        Ok(())
    }

    #[test]
    fn missing_file_resolves_to_defaults() -> anyhow::Result<()> {
        let workspace = TempDir::new()?;

        assert_eq!(load_stream_config(workspace.path())?, None);
        let config = resolve_stream_config(workspace.path())?;
        assert_eq!(config, StreamConfig::default());
        assert_eq!(config.watchdog_timeout(), Duration::from_secs(60));
        assert_eq!(config.throttle_interval(), Duration::from_millis(250));

        let timings = config.registry_timings();
        assert_eq!(timings.sweep_interval, Duration::from_secs(1));
        assert_eq!(timings.staleness_threshold, Duration::from_secs(120));

        Ok(())
    }

    #[test]
    fn strict_policy_shortens_the_watchdog() -> anyhow::Result<()> {
        let workspace = TempDir::new()?;
        write_stream_config_file(
            &workspace,
            r#"
schema_version = 1
watchdog_policy = "strict"
throttle_interval_ms = 100
"#,
        )?;

        let config = resolve_stream_config(workspace.path())?;
        assert_eq!(config.watchdog_policy, WatchdogPolicy::Strict);
        assert_eq!(config.watchdog_timeout(), Duration::from_secs(30));
        assert_eq!(config.throttle_interval(), Duration::from_millis(100));

        Ok(())
    }

    #[test]
    fn explicit_timeout_overrides_the_policy() -> anyhow::Result<()> {
        let workspace = TempDir::new()?;
        write_stream_config_file(
            &workspace,
            r#"
watchdog_policy = "strict"
watchdog_timeout_ms = 5000
"#,
        )?;

        let config = resolve_stream_config(workspace.path())?;
        assert_eq!(config.schema_version, STREAM_CONFIG_SCHEMA_VERSION);
        assert_eq!(config.registry_timings().watchdog_timeout, Duration::from_secs(5));

        Ok(())
    }

    #[test]
    fn rejects_unknown_fields() -> anyhow::Result<()> {
        let workspace = TempDir::new()?;
        write_stream_config_file(&workspace, "watchdog_seconds = 10\n")?;

        let error = load_stream_config(workspace.path());
        assert!(matches!(error, Err(StreamConfigError::ParseFailed { .. })));

        Ok(())
    }

    #[test]
    fn rejects_unsupported_schema_version() -> anyhow::Result<()> {
        let workspace = TempDir::new()?;
        write_stream_config_file(&workspace, "schema_version = 2\n")?;

        let error = load_stream_config(workspace.path());
        assert!(matches!(
            error,
            Err(StreamConfigError::UnsupportedSchemaVersion {
                expected: 1,
                found: 2,
                ..
            })
        ));

        Ok(())
    }

    #[test]
    fn rejects_zero_sweep_interval() -> anyhow::Result<()> {
        let workspace = TempDir::new()?;
        write_stream_config_file(&workspace, "sweep_interval_ms = 0\n")?;

        let error = load_stream_config(workspace.path());
        assert!(matches!(
            error,
            Err(StreamConfigError::ZeroInterval {
                field: "sweep_interval_ms",
                ..
            })
        ));

        Ok(())
    }

    fn zero_interval_field(contents: &str) -> anyhow::Result<Option<&'static str>> {
        let workspace = TempDir::new()?;
        write_stream_config_file(&workspace, contents)?;
        Ok(match load_stream_config(workspace.path()) {
            Err(StreamConfigError::ZeroInterval { field, .. }) => Some(field),
            _ => None,
        })
    }

    #[test]
    fn rejects_zero_staleness_threshold() -> anyhow::Result<()> {
        assert_eq!(
            zero_interval_field("staleness_threshold_ms = 0\n")?,
            Some("staleness_threshold_ms")
        );
        Ok(())
    }

    #[test]
    fn rejects_zero_watchdog_timeout_only_when_set() -> anyhow::Result<()> {
        assert_eq!(
            zero_interval_field("watchdog_timeout_ms = 0\n")?,
            Some("watchdog_timeout_ms")
        );
        assert_eq!(zero_interval_field("watchdog_policy = \"strict\"\n")?, None);
        Ok(())
    }

    #[test]
    fn rejects_zero_throttle_interval() -> anyhow::Result<()> {
        assert_eq!(
            zero_interval_field("throttle_interval_ms = 0\n")?,
            Some("throttle_interval_ms")
        );
        Ok(())
    }
}
