//! Composition configuration.
//!
//! A mount is described by a set of named backends and a list of path mappings. Backends refer
//! to each other by name, so arbitrary stacks (an encrypted cache over a RAID of local disks, for
//! instance) are written as a flat table:
//!
//! ```toml
//! [backends.disk-a]
//! type = "local"
//! path = "/srv/a"
//!
//! [backends.disk-b]
//! type = "local"
//! path = "/srv/b"
//!
//! [backends.mirror]
//! type = "raid"
//! level = 1
//! members = ["disk-a", "disk-b"]
//!
//! [[mappings]]
//! path = "/"
//! backend = "mirror"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use bytesize::ByteSize;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::fs::cache::{CacheProvider, CachePolicy};
use crate::fs::encrypted::{CipherKind, EncryptedProvider};
use crate::fs::local::LocalProvider;
use crate::fs::memory::MemoryProvider;
use crate::fs::multi::{MultiProvider, Strategy};
use crate::fs::raid::RaidProvider;
use crate::fs::raid::geometry::{Geometry, Level};
use crate::fs::router::RouterProvider;
use crate::fs::{DynProvider, FsError};

const fn default_stripe_size() -> ByteSize {
    ByteSize::b(Geometry::DEFAULT_STRIPE_SIZE)
}

/// One named backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum BackendConfig {
    /// A volatile in-memory tree.
    Memory,

    /// A host directory.
    Local { path: PathBuf },

    /// Striping, mirroring or parity over other backends.
    Raid {
        level: Level,
        members: Vec<String>,
        #[serde(default = "default_stripe_size")]
        stripe_size: ByteSize,
    },

    /// A fast `slave` tier in front of an authoritative `master`.
    Cache {
        master: String,
        slave: String,
        #[serde(default)]
        policy: CachePolicy,
    },

    /// Transparent content encryption over another backend.
    Encrypted {
        provider: String,
        password: SecretString,
        #[serde(default)]
        cipher: CipherKind,
        /// Base64 salt. Without one, content is only readable by the process that wrote it.
        salt: Option<String>,
    },

    /// Replicas queried by failover or quorum.
    Multi {
        #[serde(default)]
        strategy: Strategy,
        members: Vec<String>,
    },
}

impl BackendConfig {
    /// Names of the backends this one is stacked on.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            Self::Memory | Self::Local { .. } => Vec::new(),
            Self::Raid { members, .. } | Self::Multi { members, .. } => {
                members.iter().map(String::as_str).collect()
            }
            Self::Cache { master, slave, .. } => vec![master.as_str(), slave.as_str()],
            Self::Encrypted { provider, .. } => vec![provider.as_str()],
        }
    }
}

/// Mounts `backend` at `path` in the router.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathMapping {
    pub path: PathBuf,
    pub backend: String,
}

/// A complete mount description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfig {
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub mappings: Vec<PathMapping>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse mount description: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Reasons a mount description cannot be turned into a provider graph.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no path mappings configured")]
    NoMappings,

    #[error("backend '{name}' referenced by {referenced_by} is not defined")]
    UnknownBackend { name: String, referenced_by: String },

    #[error("backends form a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("backend '{name}' has an invalid salt: {source}")]
    InvalidSalt {
        name: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("backend '{name}' could not be created: {source}")]
    Backend {
        name: String,
        #[source]
        source: FsError,
    },

    #[error("mapping '{}' could not be registered: {source}", path.display())]
    Mapping {
        path: PathBuf,
        #[source]
        source: FsError,
    },
}

impl MountConfig {
    /// Parse a TOML mount description.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Build every mapped backend and register it with a fresh router.
    ///
    /// A backend referenced from several places is built once and shared.
    pub fn build(&self) -> Result<RouterProvider, ComposeError> {
        if self.mappings.is_empty() {
            return Err(ComposeError::NoMappings);
        }
        let mut builder = Builder {
            config: self,
            built: HashMap::new(),
            stack: Vec::new(),
        };
        let router = RouterProvider::new();
        for mapping in &self.mappings {
            let provider = builder.build(
                &mapping.backend,
                &format!("mapping '{}'", mapping.path.display()),
            )?;
            router
                .handle(&mapping.path, provider)
                .map_err(|source| ComposeError::Mapping {
                    path: mapping.path.clone(),
                    source,
                })?;
        }
        Ok(router)
    }
}

struct Builder<'a> {
    config: &'a MountConfig,
    built: HashMap<String, DynProvider>,
    /// Names currently being built, outermost first.
    stack: Vec<String>,
}

impl Builder<'_> {
    fn build(&mut self, name: &str, referenced_by: &str) -> Result<DynProvider, ComposeError> {
        if let Some(provider) = self.built.get(name) {
            return Ok(Arc::clone(provider));
        }
        if let Some(pos) = self.stack.iter().position(|n| n == name) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(name.to_owned());
            return Err(ComposeError::Cycle(cycle));
        }
        let mount = self.config;
        let config = mount.backends.get(name).ok_or_else(|| {
            ComposeError::UnknownBackend {
                name: name.to_owned(),
                referenced_by: referenced_by.to_owned(),
            }
        })?;

        self.stack.push(name.to_owned());
        let provider = self.instantiate(name, config);
        self.stack.pop();
        let provider = provider?;

        debug!(name, "built backend");
        self.built.insert(name.to_owned(), Arc::clone(&provider));
        Ok(provider)
    }

    fn members(&mut self, name: &str, members: &[String]) -> Result<Vec<DynProvider>, ComposeError> {
        let referenced_by = format!("backend '{name}'");
        members
            .iter()
            .map(|member| self.build(member, &referenced_by))
            .collect()
    }

    fn instantiate(
        &mut self,
        name: &str,
        config: &BackendConfig,
    ) -> Result<DynProvider, ComposeError> {
        let backend_err = |source| ComposeError::Backend {
            name: name.to_owned(),
            source,
        };
        let referenced_by = format!("backend '{name}'");
        let provider: DynProvider = match config {
            BackendConfig::Memory => Arc::new(MemoryProvider::new()),
            BackendConfig::Local { path } => Arc::new(LocalProvider::new(path).map_err(backend_err)?),
            BackendConfig::Raid {
                level,
                members,
                stripe_size,
            } => {
                let members = self.members(name, members)?;
                Arc::new(
                    RaidProvider::new(*level, members, stripe_size.as_u64())
                        .map_err(backend_err)?,
                )
            }
            BackendConfig::Cache {
                master,
                slave,
                policy,
            } => {
                let master = self.build(master, &referenced_by)?;
                let slave = self.build(slave, &referenced_by)?;
                Arc::new(CacheProvider::new(master, slave, *policy))
            }
            BackendConfig::Encrypted {
                provider,
                password,
                cipher,
                salt,
            } => {
                let salt = salt
                    .as_deref()
                    .map(|salt| base64::engine::general_purpose::STANDARD.decode(salt))
                    .transpose()
                    .map_err(|source| ComposeError::InvalidSalt {
                        name: name.to_owned(),
                        source,
                    })?;
                let inner = self.build(provider, &referenced_by)?;
                Arc::new(EncryptedProvider::new(
                    inner,
                    password.clone(),
                    *cipher,
                    salt,
                ))
            }
            BackendConfig::Multi { strategy, members } => {
                let members = self.members(name, members)?;
                Arc::new(MultiProvider::new(*strategy, members).map_err(backend_err)?)
            }
        };
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parses_every_backend_type() {
        let config = MountConfig::from_toml(
            r#"
            [backends.mem]
            type = "memory"

            [backends.disk]
            type = "local"
            path = "/tmp"

            [backends.stripes]
            type = "raid"
            level = 5
            members = ["mem", "disk", "mem"]
            stripe-size = "4 KiB"

            [backends.fast]
            type = "cache"
            master = "stripes"
            slave = "mem"
            policy = "write-back"

            [backends.secret]
            type = "encrypted"
            provider = "fast"
            password = "hunter2"
            cipher = "aes-128-gcm"
            salt = "c2FsdHNhbHRzYWx0c2FsdA=="

            [backends.replicas]
            type = "multi"
            strategy = "majority"
            members = ["mem", "disk", "secret"]

            [[mappings]]
            path = "/"
            backend = "replicas"
            "#,
        )
        .unwrap();

        assert_eq!(config.backends.len(), 6);
        assert!(matches!(config.backends["mem"], BackendConfig::Memory));
        let BackendConfig::Raid {
            level, stripe_size, ..
        } = &config.backends["stripes"]
        else {
            panic!("expected a raid backend");
        };
        assert_eq!(*level, Level::Raid5);
        assert_eq!(stripe_size.as_u64(), 4096);
        assert!(matches!(
            config.backends["fast"],
            BackendConfig::Cache {
                policy: CachePolicy::WriteBack,
                ..
            }
        ));
        assert!(matches!(
            config.backends["secret"],
            BackendConfig::Encrypted {
                cipher: CipherKind::Aes128Gcm,
                ..
            }
        ));
        assert_eq!(
            config.backends["replicas"].dependencies(),
            vec!["mem", "disk", "secret"]
        );
    }

    #[test]
    fn stripe_size_defaults_to_64_kib() {
        let config = MountConfig::from_toml(
            r#"
            [backends.r]
            type = "raid"
            level = 0
            members = ["a", "b"]
            "#,
        )
        .unwrap();
        let BackendConfig::Raid { stripe_size, .. } = &config.backends["r"] else {
            panic!("expected a raid backend");
        };
        assert_eq!(stripe_size.as_u64(), 64 * 1024);
    }

    #[test]
    fn rejects_unsupported_raid_level() {
        let err = MountConfig::from_toml(
            r#"
            [backends.r]
            type = "raid"
            level = 3
            members = ["a", "b"]
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn detects_cycles() {
        let config = MountConfig::from_toml(
            r#"
            [backends.a]
            type = "encrypted"
            provider = "b"
            password = "x"

            [backends.b]
            type = "cache"
            master = "a"
            slave = "a"

            [[mappings]]
            path = "/"
            backend = "a"
            "#,
        )
        .unwrap();
        let Err(ComposeError::Cycle(cycle)) = config.build() else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn detects_unknown_backends() {
        let config = MountConfig::from_toml(
            r#"
            [backends.m]
            type = "multi"
            members = ["ghost"]

            [[mappings]]
            path = "/"
            backend = "m"
            "#,
        )
        .unwrap();
        let Err(ComposeError::UnknownBackend { name, referenced_by }) = config.build() else {
            panic!("expected an unknown backend");
        };
        assert_eq!(name, "ghost");
        assert_eq!(referenced_by, "backend 'm'");
    }

    #[test]
    fn builds_router_with_every_mapping() {
        let config = MountConfig::from_toml(
            r#"
            [backends.a]
            type = "memory"

            [backends.b]
            type = "memory"

            [[mappings]]
            path = "/"
            backend = "a"

            [[mappings]]
            path = "/archive"
            backend = "b"
            "#,
        )
        .unwrap();
        let router = config.build().unwrap();
        assert_eq!(
            router.mount_paths(),
            vec![PathBuf::from("/archive"), PathBuf::from("/")]
        );
    }

    #[test]
    fn rejects_empty_mappings() {
        assert!(matches!(
            MountConfig::default().build(),
            Err(ComposeError::NoMappings)
        ));
    }
}
