//! Function loader: resolves a module path and entrypoint to a [`Handler`].
//!
//! Resolution never panics across this boundary. Every failure comes back as
//! a [`LoadError`] so the caller decides whether to stay generic or to fail a
//! specialization request.

use crate::function::handler::Handler;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info};

/// Failure to resolve a module or one of its exports.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot find module '{path}'")]
    ModuleNotFound { path: String },

    #[error("module '{path}' has no export named '{name}'")]
    ExportNotFound { path: String, name: String },

    #[error("module '{path}' has no default export")]
    NoDefaultExport { path: String },

    #[error("failed to load library '{path}'")]
    Library {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("loading '{path}' panicked: {message}")]
    Panicked { path: String, message: String },
}

/// Resolves module paths to handlers.
///
/// Return `Ok(None)` for paths this resolver does not know so the next one
/// gets a chance.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, path: &str, entrypoint: Option<&str>) -> Result<Option<Handler>, LoadError>;
}

/// An in-process module: a default export plus named exports.
#[derive(Clone, Default)]
pub struct Module {
    default: Option<Handler>,
    exports: HashMap<String, Handler>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default export.
    pub fn default_export(mut self, handler: Handler) -> Self {
        self.default = Some(handler);
        self
    }

    /// Add a named export.
    pub fn export(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.exports.insert(name.into(), handler);
        self
    }

    fn get(&self, path: &str, entrypoint: Option<&str>) -> Result<Handler, LoadError> {
        match entrypoint {
            Some(name) => self
                .exports
                .get(name)
                .cloned()
                .ok_or_else(|| LoadError::ExportNotFound {
                    path: path.to_string(),
                    name: name.to_string(),
                }),
            None => self.default.clone().ok_or_else(|| LoadError::NoDefaultExport {
                path: path.to_string(),
            }),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.exports.keys().collect();
        names.sort();
        f.debug_struct("Module")
            .field("default", &self.default)
            .field("exports", &names)
            .finish()
    }
}

/// Modules compiled into the host process, addressed by path.
#[derive(Default)]
pub struct ModuleTable {
    modules: RwLock<HashMap<String, Module>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under `path`, replacing any previous module there.
    pub fn insert(&self, path: impl Into<String>, module: Module) {
        let path = normalize(&path.into());
        if let Ok(mut modules) = self.modules.write() {
            modules.insert(path, module);
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_module(self, path: impl Into<String>, module: Module) -> Self {
        self.insert(path, module);
        self
    }

    pub fn len(&self) -> usize {
        self.modules.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleResolver for ModuleTable {
    fn resolve(&self, path: &str, entrypoint: Option<&str>) -> Result<Option<Handler>, LoadError> {
        let modules = match self.modules.read() {
            Ok(modules) => modules,
            Err(_) => return Ok(None),
        };
        match modules.get(&normalize(path)) {
            Some(module) => module.get(path, entrypoint).map(Some),
            None => Ok(None),
        }
    }
}

/// `./function/handler`, `function/handler/` and `function//handler` all name
/// the same module.
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// A successfully loaded function.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub handler: Handler,
    pub elapsed: Duration,
}

/// Tries each registered resolver in order.
#[derive(Clone, Default)]
pub struct FunctionLoader {
    resolvers: Vec<Arc<dyn ModuleResolver>>,
}

impl FunctionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolver. Earlier resolvers win.
    pub fn with_resolver(mut self, resolver: impl ModuleResolver + 'static) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    /// Add a shared resolver.
    pub fn with_shared_resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Resolve `path` and select `entrypoint`, or the default export when the
    /// entrypoint is absent or empty.
    pub fn load(&self, path: &str, entrypoint: Option<&str>) -> Result<Loaded, LoadError> {
        let entrypoint = entrypoint.filter(|name| !name.is_empty());
        let started = Instant::now();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.resolve(path, entrypoint)
        }))
        .unwrap_or_else(|_| {
            Err(LoadError::Panicked {
                path: path.to_string(),
                message: "resolver panicked".to_string(),
            })
        });

        let elapsed = started.elapsed();
        match result {
            Ok(handler) => {
                info!(
                    "User code '{}'{} loaded in {:?} ({} protocol)",
                    path,
                    entrypoint.map(|e| format!(" [{}]", e)).unwrap_or_default(),
                    elapsed,
                    handler.protocol()
                );
                Ok(Loaded { handler, elapsed })
            }
            Err(err) => {
                error!("User code load error: {}", err);
                Err(err)
            }
        }
    }

    fn resolve(&self, path: &str, entrypoint: Option<&str>) -> Result<Handler, LoadError> {
        for resolver in &self.resolvers {
            if let Some(handler) = resolver.resolve(path, entrypoint)? {
                return Ok(handler);
            }
        }
        Err(LoadError::ModuleNotFound {
            path: path.to_string(),
        })
    }
}
