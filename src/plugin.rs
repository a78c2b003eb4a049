//! Resolves analyzer references into loaded analyzer instances.
//!
//! A reference such as `github.com/acme/tls-sni` maps to a checkout under the
//! plugin cache root. On first use the source is cloned, afterwards it is
//! optionally refreshed. Every run rebuilds the module and loads it into the
//! process.

use log::{info, warn};
use std::collections::BTreeMap;
use std::env::consts::DLL_EXTENSION;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::analyzer::Analyzer;
use crate::loader::{DylibLoader, LoadError, ModuleLoader};
use crate::registry::{AnalyzerRegistry, RegistryBuilder};
use crate::toolchain::{SystemToolchain, ToolError, Toolchain};

/// Files a checkout must contain to be buildable.
pub const ENTRY_POINTS: [&str; 2] = ["Cargo.toml", "src/lib.rs"];

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid analyzer reference '{0}'")]
    InvalidReference(String),

    #[error("could not determine the home directory for the plugin cache")]
    NoHomeDir,

    #[error("could not inspect {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install {reference}: {source}")]
    Fetch {
        reference: String,
        #[source]
        source: ToolError,
    },

    #[error("{reference} has no entry point, expected {path}")]
    MissingEntryPoint { reference: String, path: PathBuf },

    #[error("failed to build {reference}: {source}")]
    Build {
        reference: String,
        #[source]
        source: ToolError,
    },

    #[error("failed to load {reference}: {source}")]
    Load {
        reference: String,
        #[source]
        source: LoadError,
    },
}

/// Where a reference lives locally. Only exists while the reference is being
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub reference: String,
    pub local_dir: PathBuf,
}

impl PluginDescriptor {
    /// Deterministic location of the built module.
    pub fn module_path(&self) -> PathBuf {
        self.local_dir.join(format!("analyzer.{}", DLL_EXTENSION))
    }
}

/// `~/.nids/plugins`
pub fn default_cache_root() -> Result<PathBuf, PluginError> {
    dirs::home_dir()
        .map(|home| home.join(".nids").join("plugins"))
        .ok_or(PluginError::NoHomeDir)
}

pub struct PluginManager<T = SystemToolchain, L = DylibLoader> {
    cache_root: PathBuf,
    refresh: bool,
    toolchain: T,
    loader: L,
}

impl PluginManager {
    pub fn new(cache_root: impl Into<PathBuf>, refresh: bool) -> Self {
        PluginManager::with_backends(cache_root, refresh, SystemToolchain::new(), DylibLoader)
    }
}

impl<T: Toolchain, L: ModuleLoader> PluginManager<T, L> {
    pub fn with_backends(
        cache_root: impl Into<PathBuf>,
        refresh: bool,
        toolchain: T,
        loader: L,
    ) -> Self {
        PluginManager {
            cache_root: cache_root.into(),
            refresh,
            toolchain,
            loader,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Maps a reference to its checkout directory. References must be
    /// relative paths without `..` so they cannot escape the cache root.
    pub fn descriptor(&self, reference: &str) -> Result<PluginDescriptor, PluginError> {
        let mut parts = Vec::new();
        for component in Path::new(reference.trim()).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy()),
                _ => return Err(PluginError::InvalidReference(reference.to_string())),
            }
        }
        if parts.is_empty() {
            return Err(PluginError::InvalidReference(reference.to_string()));
        }
        // Rejoined from the components so that spellings differing only in
        // slashes name the same plugin.
        let normalized = parts.join("/");
        Ok(PluginDescriptor {
            local_dir: self.cache_root.join(&normalized),
            reference: normalized,
        })
    }

    /// Fetches, builds and loads every reference, in sorted order. The first
    /// failure aborts the whole run and nothing is returned.
    pub fn load_all<I, S>(&self, references: I) -> Result<AnalyzerRegistry, PluginError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // Deduplicated on the normalized reference, in sorted order.
        let mut descriptors = BTreeMap::new();
        for reference in references {
            let descriptor = self.descriptor(reference.as_ref())?;
            descriptors.entry(descriptor.reference.clone()).or_insert(descriptor);
        }

        let mut builder = RegistryBuilder::new();
        for descriptor in descriptors.into_values() {
            builder.push(self.resolve(descriptor)?);
        }
        info!("Loaded {} analyzer(s)", builder.len());
        Ok(builder.finish())
    }

    /// Runs the full fetch/refresh, check, build, load sequence for one
    /// plugin and constructs its analyzer.
    pub fn resolve(&self, descriptor: PluginDescriptor) -> Result<Box<dyn Analyzer>, PluginError> {
        let PluginDescriptor {
            reference,
            local_dir,
        } = &descriptor;

        if !dir_exists(local_dir)? {
            info!("Installing {}", reference);
            self.toolchain
                .fetch(reference, local_dir)
                .map_err(|source| PluginError::Fetch {
                    reference: reference.clone(),
                    source,
                })?;
        } else if self.refresh {
            info!("Updating {}", reference);
            if let Err(e) = self.toolchain.update(local_dir) {
                warn!(
                    "Could not update {}, continuing with the cached copy: {}",
                    reference, e
                );
            }
        }

        for entry in ENTRY_POINTS {
            let path = local_dir.join(entry);
            if !path.is_file() {
                return Err(PluginError::MissingEntryPoint {
                    reference: reference.clone(),
                    path,
                });
            }
        }

        info!("Building {}", reference);
        let module = descriptor.module_path();
        self.toolchain
            .build(local_dir, &module)
            .map_err(|source| PluginError::Build {
                reference: reference.clone(),
                source,
            })?;

        let analyzer = self
            .loader
            .load(&module)
            .map_err(|source| PluginError::Load {
                reference: reference.clone(),
                source,
            })?;
        info!("Loaded analyzer '{}' from {}", analyzer.name(), reference);
        Ok(analyzer)
    }
}

fn dir_exists(path: &Path) -> Result<bool, PluginError> {
    match path.metadata() {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(PluginError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
