//! TOML configuration for gpubench.
//!
//! Every section has compiled-in defaults, so an empty or partial file is
//! valid. Command-line flags are applied on top of whatever was loaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BenchError;
use crate::runtime::Backend;
use crate::selector::DevicePreference;
use crate::session::SessionOptions;
use crate::source::DEFAULT_KERNEL_PATH;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "GPUBENCH_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "gpubench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded benchmark configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (a `--config` argument); failure to load it is an error.
    /// 2. The file named by `GPUBENCH_CONFIG`.
    /// 3. `./gpubench.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::resolve_from(
            explicit,
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            Path::new(LOCAL_CONFIG),
        )
    }

    fn resolve_from(explicit: Option<&Path>, env_path: Option<PathBuf>, local: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Some(path) = env_path {
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let b = &self.benchmark;
        if b.elements == 0 {
            return Err(BenchError::InvalidConfig("benchmark.elements must be > 0".into()));
        }
        if u32::try_from(b.elements).is_err() {
            return Err(BenchError::InvalidConfig(format!(
                "benchmark.elements must fit the kernel's 32-bit count (max {})",
                u32::MAX
            )));
        }
        if b.work_group_size == 0 {
            return Err(BenchError::InvalidConfig(
                "benchmark.work_group_size must be > 0".into(),
            ));
        }
        if b.repetitions == 0 {
            return Err(BenchError::InvalidConfig("benchmark.repetitions must be > 0".into()));
        }
        if b.transfer_repetitions == 0 {
            return Err(BenchError::InvalidConfig(
                "benchmark.transfer_repetitions must be > 0".into(),
            ));
        }
        if self.kernel.entry_point.trim().is_empty() {
            return Err(BenchError::InvalidConfig("kernel.entry_point must not be empty".into()));
        }
        if self.kernel.build_timeout_secs == 0 {
            return Err(BenchError::InvalidConfig(
                "kernel.build_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            entry_point: self.kernel.entry_point.clone(),
            build_options: self.kernel.build_options.clone(),
            build_timeout: Duration::from_secs(self.kernel.build_timeout_secs),
        }
    }

    pub fn device_preference(&self) -> DevicePreference {
        self.device.index.into()
    }
}

// ---------------------------------------------------------------------------
// Benchmark
// ---------------------------------------------------------------------------

/// Problem size and repetition counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Number of `f32` elements per array.
    pub elements: usize,
    pub work_group_size: usize,
    /// Timed kernel dispatches.
    pub repetitions: usize,
    /// Timed device-to-host copies of the output.
    pub transfer_repetitions: usize,
    /// Seed for the input data generator.
    pub seed: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            elements: 100_000_000,
            work_group_size: 128,
            repetitions: 20,
            transfer_repetitions: 20,
            seed: 239,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub source_path: PathBuf,
    pub entry_point: String,
    /// Passed verbatim to the runtime compiler.
    pub build_options: String,
    pub build_timeout_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from(DEFAULT_KERNEL_PATH),
            entry_point: "aplusb".to_string(),
            build_options: String::new(),
            build_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: Backend,
    /// Catalog index overriding the GPU-then-CPU policy.
    pub index: Option<usize>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.benchmark.elements, 100_000_000);
        assert_eq!(cfg.benchmark.work_group_size, 128);
        assert_eq!(cfg.benchmark.repetitions, 20);
        assert_eq!(cfg.kernel.entry_point, "aplusb");
        assert_eq!(cfg.kernel.source_path, PathBuf::from("src/cl/aplusb.cl"));
        assert_eq!(cfg.device.backend, Backend::Host);
        assert_eq!(cfg.device_preference(), DevicePreference::Auto);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[benchmark]\nelements = 4096\n\n[device]\nbackend = \"opencl\"\nindex = 1"
        )
        .unwrap();
        let cfg = BenchConfig::load(file.path()).unwrap();
        assert_eq!(cfg.benchmark.elements, 4096);
        assert_eq!(cfg.benchmark.work_group_size, 128);
        assert_eq!(cfg.device.backend, Backend::OpenCl);
        assert_eq!(cfg.device_preference(), DevicePreference::Index(1));
        assert_eq!(cfg.kernel.build_timeout_secs, 30);
    }

    #[test]
    fn test_explicit_path_must_load() {
        let err = BenchConfig::resolve_from(
            Some(Path::new("/nonexistent/gpubench.toml")),
            None,
            Path::new("/nonexistent/local.toml"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_bad_env_file_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("gpubench.toml");
        std::fs::write(&local, "[benchmark]\nrepetitions = 3\n").unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "this is = = not toml").unwrap();

        let cfg = BenchConfig::resolve_from(None, Some(bad), &local).unwrap();
        assert_eq!(cfg.benchmark.repetitions, 3);
    }

    #[test]
    fn test_nothing_found_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BenchConfig::resolve_from(None, None, &dir.path().join("missing.toml")).unwrap();
        assert_eq!(cfg.benchmark.seed, 239);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut cfg = BenchConfig::default();
        cfg.benchmark.work_group_size = 0;
        assert!(matches!(cfg.validate(), Err(BenchError::InvalidConfig(_))));

        let mut cfg = BenchConfig::default();
        cfg.benchmark.elements = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BenchConfig::default();
        cfg.benchmark.repetitions = 0;
        assert!(cfg.validate().is_err());
    }
}
