// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker configuration parser with strict validation.
//!
//! `config.json` is read once at boot. Unknown keys are ignored, missing keys
//! take defaults, and any value the worker cannot run with results in a
//! HardValidationError that prevents startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ForkliftError, ForkliftResult, HardValidationError};
use crate::storage::StoreMode;

/// Raw configuration as parsed from disk (before validation).
#[derive(Debug, Deserialize)]
struct RawConfig {
    worker_dir: Option<String>,
    #[serde(default = "default_worker_url")]
    worker_url: String,
    #[serde(default = "default_worker_port")]
    worker_port: u16,
    #[serde(default)]
    log_output: bool,
    #[serde(default = "default_sandbox")]
    sandbox: String,
    #[serde(default)]
    registry: String,
    #[serde(default = "default_registry_cache_ms")]
    registry_cache_ms: u64,
    #[serde(default)]
    pkgs_dir: String,
    #[serde(default)]
    sock_base_path: String,
    #[serde(default = "default_cgroup_root")]
    cgroup_root: String,
    mem_pool_mb: Option<u64>,
    #[serde(default)]
    import_cache_tree: Option<serde_json::Value>,
    #[serde(default)]
    docker: RawDockerConfig,
    #[serde(default)]
    limits: RawLimitsConfig,
    #[serde(default)]
    features: RawFeaturesConfig,
    #[serde(default)]
    trace: TraceConfig,
    #[serde(default)]
    storage: RawStorageConfig,
}

fn default_worker_url() -> String {
    "localhost".to_string()
}

fn default_worker_port() -> u16 {
    5000
}

fn default_sandbox() -> String {
    "sock".to_string()
}

fn default_registry_cache_ms() -> u64 {
    5000
}

fn default_cgroup_root() -> String {
    "/sys/fs/cgroup".to_string()
}

#[derive(Debug, Deserialize)]
struct RawDockerConfig {
    #[serde(default)]
    runtime: String,
    #[serde(default = "default_base_image")]
    base_image: String,
}

fn default_base_image() -> String {
    "ol-min".to_string()
}

impl Default for RawDockerConfig {
    fn default() -> Self {
        Self {
            runtime: String::new(),
            base_image: default_base_image(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLimitsConfig {
    #[serde(default = "default_procs")]
    procs: u64,
    #[serde(default = "default_mem_mb")]
    mem_mb: u64,
    #[serde(default = "default_cpu_percent")]
    cpu_percent: u64,
    #[serde(default = "default_max_runtime")]
    max_runtime_default: u64,
    #[serde(default)]
    swappiness: u64,
    installer_mem_mb: Option<u64>,
}

fn default_procs() -> u64 {
    10
}

fn default_mem_mb() -> u64 {
    50
}

fn default_cpu_percent() -> u64 {
    100
}

fn default_max_runtime() -> u64 {
    30
}

impl Default for RawLimitsConfig {
    fn default() -> Self {
        Self {
            procs: default_procs(),
            mem_mb: default_mem_mb(),
            cpu_percent: default_cpu_percent(),
            max_runtime_default: default_max_runtime(),
            swappiness: 0,
            installer_mem_mb: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawFeaturesConfig {
    #[serde(default)]
    import_cache: String,
    #[serde(default)]
    downsize_paused_mem: bool,
    #[serde(default)]
    reuse_cgroups: bool,
    #[serde(default)]
    enable_seccomp: bool,
    #[serde(default)]
    warmup: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawStoreEntry {
    #[serde(default)]
    mode: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageConfig {
    #[serde(default)]
    root: RawStoreEntry,
    #[serde(default)]
    code: RawStoreEntry,
    #[serde(default)]
    scratch: RawStoreEntry,
}

/// Sandbox backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Chroot + cgroup sandboxes with Zygote forking.
    Sock,
    /// One container per leaf sandbox.
    Docker,
}

/// Zygote import cache flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportCacheMode {
    #[serde(rename = "")]
    Disabled,
    #[serde(rename = "tree")]
    Tree,
    #[serde(rename = "multitree")]
    MultiTree,
}

/// Docker backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// OCI runtime passed to the daemon; empty means the daemon default.
    pub runtime: String,
    pub base_image: String,
}

/// Per-sandbox resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub procs: u64,
    pub mem_mb: u64,
    pub cpu_percent: u64,
    /// Seconds a single request may take inside a sandbox.
    pub max_runtime_default: u64,
    pub swappiness: u64,
    pub installer_mem_mb: u64,
}

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    pub import_cache: ImportCacheMode,
    pub downsize_paused_mem: bool,
    pub reuse_cgroups: bool,
    pub enable_seccomp: bool,
    pub warmup: bool,
}

/// Extra debug logging per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default)]
    pub cgroups: bool,
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub evictor: bool,
    #[serde(default)]
    pub package: bool,
    #[serde(default)]
    pub latency: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    pub mode: StoreMode,
}

/// Backing for the worker's managed directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: StoreEntry,
    pub code: StoreEntry,
    pub scratch: StoreEntry,
}

/// Complete validated worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_dir: PathBuf,
    pub worker_url: String,
    pub worker_port: u16,
    pub log_output: bool,
    pub sandbox: SandboxBackend,
    /// Local directory or http(s) URL that handlers are pulled from.
    pub registry: String,
    pub registry_cache_ms: u64,
    pub pkgs_dir: PathBuf,
    /// Read-only base image every sock sandbox root is built from.
    pub sock_base_path: PathBuf,
    pub cgroup_root: PathBuf,
    pub mem_pool_mb: u64,
    /// Inline JSON tree or path to a JSON file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_cache_tree: Option<String>,
    pub docker: DockerConfig,
    pub limits: LimitsConfig,
    pub features: FeaturesConfig,
    pub trace: TraceConfig,
    pub storage: StorageConfig,
}

/// On-disk format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// JSON unless the file extension says YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

impl WorkerConfig {
    /// Default configuration for a worker rooted at `ol_path`.
    ///
    /// The memory pool is sized from host RAM, leaving 500 MB for the
    /// worker itself.
    pub fn defaults_for(ol_path: impl AsRef<Path>) -> ForkliftResult<Self> {
        let ol_path = std::path::absolute(ol_path.as_ref())
            .map_err(|e| ForkliftError::io("resolving worker path", e))?;
        let mem_pool_mb = host_memory_mb().saturating_sub(500).max(500);
        let base = ol_path.join("lambda");

        let raw = RawConfig {
            worker_dir: Some(ol_path.join("worker").display().to_string()),
            worker_url: default_worker_url(),
            worker_port: default_worker_port(),
            log_output: true,
            sandbox: default_sandbox(),
            registry: ol_path.join("registry").display().to_string(),
            registry_cache_ms: default_registry_cache_ms(),
            pkgs_dir: base.join("packages").display().to_string(),
            sock_base_path: base.display().to_string(),
            cgroup_root: default_cgroup_root(),
            mem_pool_mb: Some(mem_pool_mb),
            import_cache_tree: None,
            docker: RawDockerConfig::default(),
            limits: RawLimitsConfig::default(),
            features: RawFeaturesConfig {
                import_cache: "tree".to_string(),
                downsize_paused_mem: true,
                reuse_cgroups: false,
                enable_seccomp: true,
                warmup: false,
            },
            trace: TraceConfig::default(),
            storage: RawStorageConfig::default(),
        };

        ConfigLoader::validate(raw)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> ForkliftResult<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ForkliftError::ConfigParse {
                message: format!("JSON serialize error: {}", e),
            })?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ForkliftError::io("writing config file", e))
    }

    /// Path of the pid file guarding a single live worker.
    pub fn pid_path(&self) -> PathBuf {
        self.worker_dir.join("worker.pid")
    }

    /// Directory holding the package installer helper.
    pub fn pip_install_dir(&self) -> PathBuf {
        self.worker_dir.join("admin-lambdas").join("pip-install")
    }

    /// Base URL of the front door.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.worker_url, self.worker_port)
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a JSON or YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> ForkliftResult<WorkerConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ForkliftError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ForkliftError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content, ConfigFormat::from_path(path))
    }

    /// Load and validate configuration from a string.
    pub fn load_string(content: &str, format: ConfigFormat) -> ForkliftResult<WorkerConfig> {
        let raw: RawConfig = match format {
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ForkliftError::ConfigParse {
                    message: format!("JSON parse error: {}", e),
                })?
            }
            ConfigFormat::Yaml => {
                serde_yaml::from_str(content).map_err(|e| ForkliftError::ConfigParse {
                    message: format!("YAML parse error: {}", e),
                })?
            }
        };

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> ForkliftResult<WorkerConfig> {
        let worker_dir = raw
            .worker_dir
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| HardValidationError::MissingRequiredField {
                field: "worker_dir",
                context: "worker config".to_string(),
            })?;
        Self::require_absolute("worker_dir", &worker_dir)?;

        if raw.worker_port == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "worker_port",
                value: "0".to_string(),
                reason: "Port 0 is reserved and cannot be used".to_string(),
            }
            .into());
        }

        let sandbox = match raw.sandbox.as_str() {
            "sock" => SandboxBackend::Sock,
            "docker" => SandboxBackend::Docker,
            other => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "sandbox",
                    value: other.to_string(),
                    reason: "expected sock or docker".to_string(),
                }
                .into())
            }
        };

        let import_cache = match raw.features.import_cache.as_str() {
            "" => ImportCacheMode::Disabled,
            "tree" => ImportCacheMode::Tree,
            "multitree" => ImportCacheMode::MultiTree,
            other => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "features.import_cache",
                    value: other.to_string(),
                    reason: "expected \"\", tree or multitree".to_string(),
                }
                .into())
            }
        };

        let mem_pool_mb = raw
            .mem_pool_mb
            .unwrap_or_else(|| host_memory_mb().saturating_sub(500).max(500));
        let limits = Self::validate_limits(raw.limits, mem_pool_mb)?;

        let sock_base_path = PathBuf::from(&raw.sock_base_path);
        let pkgs_dir = if raw.pkgs_dir.is_empty() {
            sock_base_path.join("packages")
        } else {
            PathBuf::from(&raw.pkgs_dir)
        };

        match sandbox {
            SandboxBackend::Sock => {
                if raw.sock_base_path.is_empty() {
                    return Err(HardValidationError::MissingRequiredField {
                        field: "sock_base_path",
                        context: "sock sandbox".to_string(),
                    }
                    .into());
                }
                Self::require_absolute("sock_base_path", &sock_base_path)?;
                // sandboxes import from /packages inside the base image
                if pkgs_dir != sock_base_path.join("packages") {
                    return Err(HardValidationError::InvalidFieldValue {
                        field: "pkgs_dir",
                        value: pkgs_dir.display().to_string(),
                        reason: format!(
                            "sock sandboxes read packages from {}",
                            sock_base_path.join("packages").display()
                        ),
                    }
                    .into());
                }

                let required_mb = 2 * limits.installer_mem_mb.max(limits.mem_mb);
                if mem_pool_mb < required_mb {
                    return Err(HardValidationError::MemoryPoolTooSmall {
                        pool_mb: mem_pool_mb,
                        required_mb,
                    }
                    .into());
                }
            }
            SandboxBackend::Docker => {
                Self::require_absolute("pkgs_dir", &pkgs_dir)?;
                if import_cache != ImportCacheMode::Disabled {
                    return Err(HardValidationError::SchemaValidation {
                        message: "features.import_cache requires the sock sandbox".to_string(),
                    }
                    .into());
                }
            }
        }

        let import_cache_tree = match raw.import_cache_tree {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(tree @ serde_json::Value::Object(_)) => Some(tree.to_string()),
            Some(other) => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "import_cache_tree",
                    value: other.to_string(),
                    reason: "expected a JSON object or a path".to_string(),
                }
                .into())
            }
        };

        Ok(WorkerConfig {
            worker_dir,
            worker_url: raw.worker_url,
            worker_port: raw.worker_port,
            log_output: raw.log_output,
            sandbox,
            registry: raw.registry,
            registry_cache_ms: raw.registry_cache_ms,
            pkgs_dir,
            sock_base_path,
            cgroup_root: PathBuf::from(raw.cgroup_root),
            mem_pool_mb,
            import_cache_tree,
            docker: DockerConfig {
                runtime: raw.docker.runtime,
                base_image: raw.docker.base_image,
            },
            limits,
            features: FeaturesConfig {
                import_cache,
                downsize_paused_mem: raw.features.downsize_paused_mem,
                reuse_cgroups: raw.features.reuse_cgroups,
                enable_seccomp: raw.features.enable_seccomp,
                warmup: raw.features.warmup,
            },
            trace: raw.trace,
            storage: StorageConfig {
                root: Self::validate_store("storage.root.mode", &raw.storage.root)?,
                code: Self::validate_store("storage.code.mode", &raw.storage.code)?,
                scratch: Self::validate_store("storage.scratch.mode", &raw.storage.scratch)?,
            },
        })
    }

    fn validate_limits(raw: RawLimitsConfig, mem_pool_mb: u64) -> ForkliftResult<LimitsConfig> {
        let positive = [
            ("limits.procs", raw.procs),
            ("limits.mem_mb", raw.mem_mb),
            ("limits.cpu_percent", raw.cpu_percent),
            ("limits.max_runtime_default", raw.max_runtime_default),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Must be greater than 0".to_string(),
                }
                .into());
            }
        }

        if raw.swappiness > 200 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "limits.swappiness",
                value: raw.swappiness.to_string(),
                reason: "Must be between 0 and 200".to_string(),
            }
            .into());
        }

        let installer_mem_mb = raw
            .installer_mem_mb
            .unwrap_or_else(|| (mem_pool_mb / 2).min(500).max(250));

        Ok(LimitsConfig {
            procs: raw.procs,
            mem_mb: raw.mem_mb,
            cpu_percent: raw.cpu_percent,
            max_runtime_default: raw.max_runtime_default,
            swappiness: raw.swappiness,
            installer_mem_mb,
        })
    }

    fn validate_store(field: &'static str, raw: &RawStoreEntry) -> ForkliftResult<StoreEntry> {
        let mode = raw
            .mode
            .parse::<StoreMode>()
            .map_err(|_| HardValidationError::InvalidFieldValue {
                field,
                value: raw.mode.clone(),
                reason: "expected \"\", memory or private".to_string(),
            })?;
        Ok(StoreEntry { mode })
    }

    fn require_absolute(field: &'static str, path: &Path) -> ForkliftResult<()> {
        if !path.is_absolute() {
            return Err(HardValidationError::RelativePath {
                field,
                path: path.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }
}

/// Total host RAM in MB, or 0 if it cannot be determined.
fn host_memory_mb() -> u64 {
    // SAFETY: sysinfo only writes into the zeroed struct we hand it.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return 0;
    }
    (info.totalram as u64).saturating_mul(info.mem_unit as u64) / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"{
        "worker_dir": "/tmp/forklift/worker",
        "worker_port": 5001,
        "registry": "/tmp/forklift/registry",
        "registry_cache_ms": 100,
        "mem_pool_mb": 2048,
        "sock_base_path": "/tmp/forklift/lambda",
        "limits": {"mem_mb": 64, "cpu_percent": 50},
        "features": {"import_cache": "tree", "downsize_paused_mem": true},
        "import_cache_tree": {"packages": [], "children": [{"packages": ["numpy"], "children": []}]},
        "storage": {"scratch": {"mode": "memory"}},
        "some_future_key": 17
    }"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG, ConfigFormat::Json).unwrap();
        assert_eq!(config.worker_port, 5001);
        assert_eq!(config.sandbox, SandboxBackend::Sock);
        assert_eq!(config.features.import_cache, ImportCacheMode::Tree);
        assert_eq!(config.limits.mem_mb, 64);
        assert_eq!(config.limits.procs, 10);
        assert_eq!(config.pkgs_dir, PathBuf::from("/tmp/forklift/lambda/packages"));
        assert_eq!(config.storage.scratch.mode, StoreMode::Memory);
        assert_eq!(config.storage.code.mode, StoreMode::Regular);
        assert!(config.import_cache_tree.unwrap().contains("numpy"));
    }

    #[test]
    fn test_installer_mem_default() {
        let config = ConfigLoader::load_string(VALID_CONFIG, ConfigFormat::Json).unwrap();
        // min(500, 2048 / 2) = 500
        assert_eq!(config.limits.installer_mem_mb, 500);

        let small = r#"{"worker_dir": "/w", "sock_base_path": "/b", "mem_pool_mb": 600}"#;
        let config = ConfigLoader::load_string(small, ConfigFormat::Json).unwrap();
        assert_eq!(config.limits.installer_mem_mb, 300);
    }

    #[test]
    fn test_sock_packages_live_in_base() {
        let json = r#"{"worker_dir": "/w", "sock_base_path": "/b", "mem_pool_mb": 2048,
            "pkgs_dir": "/b/packages"}"#;
        let config = ConfigLoader::load_string(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.pkgs_dir, PathBuf::from("/b/packages"));

        let json = r#"{"worker_dir": "/w", "sock_base_path": "/b", "mem_pool_mb": 2048,
            "pkgs_dir": "/elsewhere/packages"}"#;
        assert!(matches!(
            ConfigLoader::load_string(json, ConfigFormat::Json),
            Err(ForkliftError::HardValidation(
                HardValidationError::InvalidFieldValue { field: "pkgs_dir", .. }
            ))
        ));
    }

    #[test]
    fn test_missing_worker_dir() {
        let result = ConfigLoader::load_string(r#"{"sock_base_path": "/b"}"#, ConfigFormat::Json);
        assert!(matches!(
            result,
            Err(ForkliftError::HardValidation(
                HardValidationError::MissingRequiredField { .. }
            ))
        ));
    }

    #[test]
    fn test_relative_worker_dir() {
        let result = ConfigLoader::load_string(
            r#"{"worker_dir": "worker", "sock_base_path": "/b", "mem_pool_mb": 2048}"#,
            ConfigFormat::Json,
        );
        assert!(matches!(
            result,
            Err(ForkliftError::HardValidation(HardValidationError::RelativePath { .. }))
        ));
    }

    #[test]
    fn test_pool_too_small_for_sock() {
        let json = r#"{"worker_dir": "/w", "sock_base_path": "/b", "mem_pool_mb": 400,
                       "limits": {"installer_mem_mb": 250}}"#;
        let result = ConfigLoader::load_string(json, ConfigFormat::Json);
        assert!(matches!(
            result,
            Err(ForkliftError::HardValidation(
                HardValidationError::MemoryPoolTooSmall { required_mb: 500, .. }
            ))
        ));
    }

    #[test]
    fn test_docker_rejects_import_cache() {
        let json = r#"{"worker_dir": "/w", "sandbox": "docker", "pkgs_dir": "/p",
                       "features": {"import_cache": "tree"}}"#;
        assert!(ConfigLoader::load_string(json, ConfigFormat::Json).is_err());

        let json = r#"{"worker_dir": "/w", "sandbox": "docker", "pkgs_dir": "/p"}"#;
        let config = ConfigLoader::load_string(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.sandbox, SandboxBackend::Docker);
        assert_eq!(config.docker.base_image, "ol-min");
    }

    #[test]
    fn test_unknown_sandbox() {
        let json = r#"{"worker_dir": "/w", "sandbox": "firecracker"}"#;
        assert!(ConfigLoader::load_string(json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_invalid_import_cache_mode() {
        let json = r#"{"worker_dir": "/w", "sock_base_path": "/b", "mem_pool_mb": 2048,
                       "features": {"import_cache": "forest"}}"#;
        assert!(ConfigLoader::load_string(json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let json = r#"{"worker_dir": "/w", "sock_base_path": "/b", "mem_pool_mb": 2048,
                       "limits": {"cpu_percent": 0}}"#;
        assert!(ConfigLoader::load_string(json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
worker_dir: /w
sock_base_path: /b
mem_pool_mb: 2048
storage:
  code:
    mode: tmpfs
features:
  import_cache: multitree
"#;
        let config = ConfigLoader::load_string(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.storage.code.mode, StoreMode::Memory);
        assert_eq!(config.features.import_cache, ImportCacheMode::MultiTree);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = ConfigLoader::load_string(VALID_CONFIG, ConfigFormat::Json).unwrap();
        config.save(&path).unwrap();

        let reloaded = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(reloaded.worker_dir, config.worker_dir);
        assert_eq!(reloaded.limits.installer_mem_mb, config.limits.installer_mem_mb);
        assert_eq!(reloaded.import_cache_tree, config.import_cache_tree);
        assert_eq!(reloaded.storage.scratch.mode, StoreMode::Memory);
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/config.json");
        assert!(matches!(result, Err(ForkliftError::ConfigNotFound { .. })));
    }
}
