//! Policy providers and the plugins that supply them.
//!
//! A plugin is a shared library built with [`declare_provider!`](crate::declare_provider),
//! which exports one entry point returning an owned [`PolicyProvider`]. The
//! library handle is kept alongside the provider and outlives it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::PluginError;
use super::model::PolicyModel;

/// Symbol exported by [`declare_provider!`](crate::declare_provider).
pub const PROVIDER_SYMBOL: &str = "warden_provider_create";

pub type ProviderFactory = fn() -> PolicyProvider;

/// A named group of policy models.
#[derive(Debug)]
pub struct PolicyProvider {
    name: String,
    models: Vec<Arc<PolicyModel>>,
}

impl PolicyProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: PolicyModel) -> Self {
        self.models.push(Arc::new(model));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn models(&self) -> &[Arc<PolicyModel>] {
        &self.models
    }
}

/// Export `$factory` as a plugin's provider entry point.
///
/// ```ignore
/// fn provider() -> PolicyProvider { ... }
/// warden::declare_provider!(provider);
/// ```
#[macro_export]
macro_rules! declare_provider {
    ($factory:path) => {
        #[unsafe(no_mangle)]
        pub fn warden_provider_create() -> $crate::policy::PolicyProvider {
            $factory()
        }
    };
}

/// An opened plugin library. Not `Clone`: the handle is shared through `Arc`.
pub struct PluginLibrary {
    path: PathBuf,
    library: libloading::Library,
}

impl PluginLibrary {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initializers. Plugins are only
        // read from the configured plugin directory, which is trusted.
        let library = unsafe { libloading::Library::new(path) }.map_err(|source| {
            PluginError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_provider(&self) -> Result<PolicyProvider, PluginError> {
        // SAFETY: the symbol is emitted by `declare_provider!`, which fixes
        // its signature to `ProviderFactory`.
        let factory = unsafe {
            self.library
                .get::<ProviderFactory>(PROVIDER_SYMBOL.as_bytes())
        }
        .map_err(|source| PluginError::MissingEntryPoint {
            path: self.path.clone(),
            source,
        })?;
        Ok(factory())
    }
}

impl fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A provider together with the library its code lives in.
#[derive(Debug)]
pub struct LoadedProvider {
    // Declared first so it drops before the library is unloaded.
    provider: PolicyProvider,
    library: Option<Arc<PluginLibrary>>,
}

impl LoadedProvider {
    /// A provider compiled into this process.
    pub fn builtin(provider: PolicyProvider) -> Self {
        Self {
            provider,
            library: None,
        }
    }

    pub fn from_library(library: Arc<PluginLibrary>) -> Result<Self, PluginError> {
        let provider = library.create_provider()?;
        Ok(Self {
            provider,
            library: Some(library),
        })
    }

    pub fn provider(&self) -> &PolicyProvider {
        &self.provider
    }

    pub fn library(&self) -> Option<&Arc<PluginLibrary>> {
        self.library.as_ref()
    }
}

/// Source of providers for a manager.
pub trait ProviderLoader: Send + Sync {
    fn load(&self) -> Result<Vec<LoadedProvider>, PluginError>;
}

/// Providers compiled into the process.
#[derive(Debug, Default)]
pub struct StaticLoader {
    factories: Vec<ProviderFactory>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factory: ProviderFactory) -> Self {
        self.factories.push(factory);
        self
    }
}

impl ProviderLoader for StaticLoader {
    fn load(&self) -> Result<Vec<LoadedProvider>, PluginError> {
        Ok(self
            .factories
            .iter()
            .map(|factory| LoadedProvider::builtin(factory()))
            .collect())
    }
}

/// Every shared library in a directory. Broken plugins are logged and skipped.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    dir: PathBuf,
}

impl DirectoryLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self) -> Result<Vec<PathBuf>, PluginError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| PluginError::Directory {
            path: self.dir.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str())
                        == Some(std::env::consts::DLL_EXTENSION)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

impl ProviderLoader for DirectoryLoader {
    fn load(&self) -> Result<Vec<LoadedProvider>, PluginError> {
        let mut loaded = Vec::new();
        for path in self.candidates()? {
            let result = PluginLibrary::open(&path)
                .and_then(|library| LoadedProvider::from_library(Arc::new(library)));
            match result {
                Ok(provider) => {
                    tracing::info!(
                        plugin = %path.display(),
                        provider = provider.provider().name(),
                        policies = provider.provider().models().len(),
                        "Loaded plugin"
                    );
                    loaded.push(provider);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping plugin"),
            }
        }
        Ok(loaded)
    }
}
