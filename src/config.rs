use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::probe::ProcessFamily;

/// Where the process-family probe reads its process table from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessTableBackend {
    /// In-process process table via sysinfo.
    #[default]
    Sysinfo,
    /// Output of the `ps` command.
    Ps,
}

impl std::fmt::Display for ProcessTableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessTableBackend::Sysinfo => write!(f, "sysinfo"),
            ProcessTableBackend::Ps => write!(f, "ps"),
        }
    }
}

/// User configuration for the benchmark harness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchSettings {
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub sampling: SamplingSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub videos: VideoSettings,
    #[serde(default)]
    pub traces: TraceSettings,
}

impl BenchSettings {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }
}

/// Browser launch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Explicit Chromium binary; falls back to `CHROMEBENCH_CHROME_BINARY` and PATH lookup.
    pub binary_path: Option<PathBuf>,
    pub headless: bool,
    /// Extra Chromium switches, with or without leading dashes.
    pub flags: Vec<String>,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            binary_path: None,
            headless: false,
            flags: Vec::new(),
            window_width: 1920,
            window_height: 1080,
        }
    }
}

/// Usage sampler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub interval_ms: u64,
    pub process_table: ProcessTableBackend,
    /// Command-line substrings identifying browser processes.
    pub family_patterns: Vec<String>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            process_table: ProcessTableBackend::default(),
            family_patterns: ProcessFamily::chromium().patterns,
        }
    }
}

impl SamplingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn browser_family(&self) -> ProcessFamily {
        if self.family_patterns.is_empty() {
            return ProcessFamily::chromium();
        }
        ProcessFamily::new("chromium", self.family_patterns.clone())
    }
}

/// Per-test execution bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub test_timeout_secs: u64,
    /// How long to wait for a timed-out test to wind down before the next one starts.
    pub cancel_grace_secs: u64,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            test_timeout_secs: 20 * 60,
            cancel_grace_secs: 30,
        }
    }
}

impl HarnessSettings {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Video asset cache options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub cache_dir: Option<PathBuf>,
    pub download_attempts: u32,
    pub download_timeout_secs: u64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            download_attempts: 3,
            download_timeout_secs: 600,
        }
    }
}

impl VideoSettings {
    pub fn resolve_cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let dirs = project_dirs()?;
        Ok(dirs.cache_dir().join("videos"))
    }
}

/// JSON trace export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub max_files: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: 10,
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "chromebench", "chromebench")
        .context("Unable to resolve platform directories")
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

pub fn default_cache_root() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().to_path_buf())
}
