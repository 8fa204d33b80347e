//! Daemon settings and the mount description, read from one TOML file.
//!
//! Top-level keys configure the process (`mount-point`, `uid`, `[daemon]`, ...). The
//! `[backends.*]` tables and `[[mappings]]` array are the mount description itself.

use thiserror::Error;
use tracing::{debug, info};

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use mount0::config::{BackendConfig, MountConfig, PathMapping};

/// `$XDG_RUNTIME_DIR/mount0`, or `~/.local/share/mount0` where there is no runtime dir.
fn state_dir() -> Option<PathBuf> {
    dirs::runtime_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|dir| dir.join("mount0"))
}

fn default_pid_file() -> PathBuf {
    state_dir().map_or_else(
        || PathBuf::from("/var/run/mount0.pid"),
        |rd| rd.join("mount0.pid"),
    )
}

fn default_mount_point() -> PathBuf {
    state_dir().map_or_else(|| PathBuf::from("/tmp/mount0/mnt"), |rd| rd.join("mnt"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// A single in-memory backend mounted at `/`.
fn default_mount() -> MountConfig {
    MountConfig {
        backends: BTreeMap::from([("memory".to_owned(), BackendConfig::Memory)]),
        mappings: vec![PathMapping {
            path: PathBuf::from("/"),
            backend: "memory".to_owned(),
        }],
    }
}

/// Settings for `mount0 run --daemonize`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// Written once the process has detached. Lives in the runtime directory by default.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Where a daemonized process writes its logs. Logs are discarded when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl DaemonConfig {
    /// Open the log file for appending, if one is configured.
    pub fn open_log_file(&self) -> Result<Option<File>, std::io::Error> {
        let Some(path) = &self.log_file else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Some)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: None,
        }
    }
}

/// Everything `mount0 run` needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Host directory the composed tree is mounted on.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// Owner of the daemon process. Defaults to the invoking user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// Group of the daemon process. Defaults to the invoking user's group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Mount the filesystem read-only.
    #[serde(default)]
    pub read_only: bool,

    /// Let users other than the mounting one access the filesystem.
    #[serde(default)]
    pub allow_other: bool,

    /// Backends and the paths they are mounted at.
    #[serde(flatten)]
    pub mount: MountConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            mount_point: default_mount_point(),
            uid: current_uid(),
            gid: current_gid(),
            read_only: false,
            allow_other: false,
            mount: default_mount(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not read config file: {0}")]
    Read(#[from] std::io::Error),
}

impl Config {
    /// Check everything that can be checked without touching a backend.
    ///
    /// Every problem is reported, one message each.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if self.mount_point.as_os_str().is_empty() {
            errors.push("Mount point must not be empty.".to_owned());
        }

        if self.mount.mappings.is_empty() {
            errors.push("At least one path mapping is required.".to_owned());
        }

        for mapping in &self.mount.mappings {
            if !mapping.path.is_absolute() {
                errors.push(format!(
                    "Mapping path '{}' must be absolute.",
                    mapping.path.display()
                ));
            }
            if !self.mount.backends.contains_key(&mapping.backend) {
                errors.push(format!(
                    "Mapping '{}' refers to undefined backend '{}'.",
                    mapping.path.display(),
                    mapping.backend
                ));
            }
        }

        for (name, backend) in &self.mount.backends {
            for dependency in backend.dependencies() {
                if !self.mount.backends.contains_key(dependency) {
                    errors.push(format!(
                        "Backend '{name}' refers to undefined backend '{dependency}'."
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Candidate config files, most specific first.
    ///
    /// `dirs::config_dir()` is skipped on macOS, where it points into `Application Support`.
    fn candidates() -> Vec<PathBuf> {
        let user_dirs = [
            #[cfg(not(target_os = "macos"))]
            dirs::config_dir(),
            dirs::home_dir().map(|home| home.join(".config")),
        ];
        user_dirs
            .into_iter()
            .flatten()
            .map(|dir| dir.join("mount0").join("config.toml"))
            .chain(std::iter::once(PathBuf::from("/etc/mount0/config.toml")))
            .collect()
    }

    /// Parses a configuration document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Reading configuration.");
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Read `explicit` if given, otherwise the first candidate file that exists.
    ///
    /// With neither, a single in-memory backend is mounted at `/`. A file that exists but does
    /// not parse is an error. The result is not validated.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let found = explicit
            .map(Path::to_path_buf)
            .or_else(|| Self::candidates().into_iter().find(|p| p.exists()));
        match found {
            Some(path) => Self::read(&path),
            None => {
                info!("No configuration file found, mounting an in-memory filesystem.");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_daemon_settings_and_backends_together() {
        let config = Config::from_toml(
            r#"
            mount-point = "/mnt/data"
            read-only = true

            [daemon]
            pid-file = "/run/mount0.pid"
            log-file = "/var/log/mount0.log"

            [backends.scratch]
            type = "memory"

            [[mappings]]
            path = "/"
            backend = "scratch"
            "#,
        )
        .unwrap();

        assert_eq!(config.mount_point, PathBuf::from("/mnt/data"));
        assert!(config.read_only);
        assert!(!config.allow_other);
        assert_eq!(
            config.daemon.log_file,
            Some(PathBuf::from("/var/log/mount0.log"))
        );
        assert_eq!(config.mount.mappings.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn validation_reports_every_problem() {
        let config = Config::from_toml(
            r#"
            [backends.mirror]
            type = "multi"
            members = ["missing"]

            [[mappings]]
            path = "relative"
            backend = "nowhere"
            "#,
        )
        .unwrap();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("must be absolute")));
        assert!(errors.iter().any(|e| e.contains("'nowhere'")));
        assert!(errors.iter().any(|e| e.contains("'missing'")));
    }

    #[test]
    fn empty_mappings_are_rejected() {
        let config = Config::from_toml("mount-point = \"/mnt\"").unwrap();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("mapping")));
    }
}
