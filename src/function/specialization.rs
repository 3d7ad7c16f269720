//! Specialization: binding the host to exactly one user function.
//!
//! The host starts `Generic`. A successful load moves it to `Specialized`,
//! which is terminal; the binding is never replaced. Loads run on the
//! blocking pool behind an async gate so concurrent attempts are serialized.

use crate::function::handler::Handler;
use crate::function::loader::{FunctionLoader, LoadError};
use crate::http::Reply;
use serde::Deserialize;
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Observable specialization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecializationState {
    Generic,
    Specializing,
    Specialized,
}

/// The function a host is bound to.
#[derive(Debug)]
pub struct BoundFunction {
    pub handler: Handler,
    pub module_path: String,
    pub entrypoint: Option<String>,
    pub load_time: Duration,
}

/// Failure of a specialization attempt.
#[derive(Debug, Error)]
pub enum SpecializeError {
    #[error("Not a generic container")]
    AlreadySpecialized,

    #[error("invalid specialization request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("specialization task failed: {0}")]
    Aborted(String),
}

impl SpecializeError {
    pub fn status_code(&self) -> u16 {
        match self {
            SpecializeError::AlreadySpecialized | SpecializeError::InvalidRequest(_) => 400,
            SpecializeError::Load(_) | SpecializeError::Aborted(_) => 500,
        }
    }

    /// Reply body: the error and its causes, outermost first.
    pub fn to_reply(&self) -> Reply {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Reply::new(self.status_code(), message)
    }
}

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecializeRequest {
    /// A module path and optional entrypoint from configuration.
    Static {
        module_path: String,
        entrypoint: Option<String>,
    },
    /// A `{filepath, functionName}` request body.
    V2 {
        filepath: String,
        function_name: String,
    },
}

#[derive(Deserialize)]
struct V2Body {
    filepath: String,
    #[serde(rename = "functionName", default)]
    function_name: String,
}

impl SpecializeRequest {
    /// Parse a `/v2/specialize` body.
    pub fn from_v2_body(body: &[u8]) -> Result<Self, SpecializeError> {
        let parsed: V2Body = serde_json::from_slice(body)
            .map_err(|e| SpecializeError::InvalidRequest(e.to_string()))?;
        Ok(SpecializeRequest::V2 {
            filepath: parsed.filepath,
            function_name: parsed.function_name,
        })
    }

    /// Module path and entrypoint this request names.
    ///
    /// `functionName` `"file.entry"` selects export `entry` of module
    /// `filepath/file`; the last dot separates the two.
    pub fn target(&self) -> (String, Option<String>) {
        match self {
            SpecializeRequest::Static {
                module_path,
                entrypoint,
            } => (
                module_path.clone(),
                entrypoint.clone().filter(|e| !e.is_empty()),
            ),
            SpecializeRequest::V2 {
                filepath,
                function_name,
            } => {
                if function_name.is_empty() {
                    return (filepath.clone(), None);
                }
                match function_name.rsplit_once('.') {
                    Some((file, entry)) => (
                        join_path(filepath, file),
                        Some(entry.to_string()).filter(|e| !e.is_empty()),
                    ),
                    None => (filepath.clone(), Some(function_name.clone())),
                }
            }
        }
    }
}

fn join_path(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), file)
    }
}

/// Owns the binding and the loader that produces it.
pub struct Specializer {
    loader: FunctionLoader,
    bound: OnceLock<Arc<BoundFunction>>,
    gate: Mutex<()>,
    loading: AtomicBool,
}

impl Specializer {
    pub fn new(loader: FunctionLoader) -> Self {
        Self {
            loader,
            bound: OnceLock::new(),
            gate: Mutex::new(()),
            loading: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SpecializationState {
        if self.bound.get().is_some() {
            SpecializationState::Specialized
        } else if self.loading.load(Ordering::Acquire) {
            SpecializationState::Specializing
        } else {
            SpecializationState::Generic
        }
    }

    /// The bound function, if any.
    pub fn bound(&self) -> Option<Arc<BoundFunction>> {
        self.bound.get().cloned()
    }

    /// Load and bind the function `request` names.
    pub async fn specialize(
        &self,
        request: SpecializeRequest,
    ) -> Result<Arc<BoundFunction>, SpecializeError> {
        if self.bound.get().is_some() {
            warn!("Specialization refused: already specialized");
            return Err(SpecializeError::AlreadySpecialized);
        }

        let _gate = self.gate.lock().await;
        if self.bound.get().is_some() {
            warn!("Specialization refused: already specialized");
            return Err(SpecializeError::AlreadySpecialized);
        }

        let (module_path, entrypoint) = request.target();
        info!(
            "Specializing with module '{}' entrypoint {:?}",
            module_path, entrypoint
        );

        let loading = LoadingFlag::raise(&self.loading);
        let loader = self.loader.clone();
        let path = module_path.clone();
        let entry = entrypoint.clone();
        let result =
            tokio::task::spawn_blocking(move || loader.load(&path, entry.as_deref())).await;
        drop(loading);

        let loaded = match result {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(err)) => return Err(SpecializeError::Load(err)),
            Err(join_err) => {
                error!("Specialization task failed: {}", join_err);
                return Err(SpecializeError::Aborted(join_err.to_string()));
            }
        };

        let bound = Arc::new(BoundFunction {
            handler: loaded.handler,
            module_path,
            entrypoint,
            load_time: loaded.elapsed,
        });
        // Only reachable while holding the gate with the slot empty.
        let bound = self.bound.get_or_init(|| bound).clone();
        info!("Specialized: {:?}", bound.handler);
        Ok(bound)
    }
}

/// Holds the `Specializing` state; lowered on drop, also when the caller's
/// future is cancelled mid-load.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Specializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specializer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::handler::Protocol;
    use crate::function::loader::{Module, ModuleResolver, ModuleTable};

    fn specializer() -> Specializer {
        let table = ModuleTable::new()
            .with_module(
                "function/handler",
                Module::new()
                    .export("main", Handler::event(|_e| async { Ok(None) }))
                    .default_export(Handler::nullary(|| async { Ok(None) })),
            )
            .with_module(
                "function",
                Module::new().export("other", Handler::event_context(|_e, _c| async { Ok(None) })),
            );
        Specializer::new(FunctionLoader::new().with_resolver(table))
    }

    #[test]
    fn test_v2_target_mapping() {
        let target = |name: &str| {
            SpecializeRequest::V2 {
                filepath: "function".into(),
                function_name: name.into(),
            }
            .target()
        };
        assert_eq!(
            target("handler.main"),
            ("function/handler".to_string(), Some("main".to_string()))
        );
        assert_eq!(target("other"), ("function".to_string(), Some("other".to_string())));
        assert_eq!(target(""), ("function".to_string(), None));
    }

    #[test]
    fn test_invalid_v2_body() {
        let err = SpecializeRequest::from_v2_body(b"not json").unwrap_err();
        assert_eq!(err.status_code(), 400);
        let ok = SpecializeRequest::from_v2_body(br#"{"filepath":"function"}"#).unwrap();
        assert_eq!(ok.target(), ("function".to_string(), None));
    }

    #[tokio::test]
    async fn test_second_specialization_is_refused() {
        let specializer = specializer();
        assert_eq!(specializer.state(), SpecializationState::Generic);

        let bound = specializer
            .specialize(SpecializeRequest::V2 {
                filepath: "function".into(),
                function_name: "handler.main".into(),
            })
            .await
            .unwrap();
        assert_eq!(bound.handler.protocol(), Protocol::EventOnly);
        assert_eq!(specializer.state(), SpecializationState::Specialized);

        let err = specializer
            .specialize(SpecializeRequest::V2 {
                filepath: "function".into(),
                function_name: "other".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpecializeError::AlreadySpecialized));
        assert_eq!(err.to_reply().status, 400);

        let still = specializer.bound().unwrap();
        assert_eq!(still.module_path, "function/handler");
        assert_eq!(still.handler.protocol(), Protocol::EventOnly);
    }

    #[tokio::test]
    async fn test_load_failure_keeps_host_generic() {
        let specializer = specializer();
        let err = specializer
            .specialize(SpecializeRequest::Static {
                module_path: "missing".into(),
                entrypoint: Some("main".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.to_reply().text_body(), "cannot find module 'missing'");
        assert_eq!(specializer.state(), SpecializationState::Generic);
        assert!(specializer.bound().is_none());

        specializer
            .specialize(SpecializeRequest::Static {
                module_path: "function/handler".into(),
                entrypoint: None,
            })
            .await
            .unwrap();
        assert_eq!(
            specializer.bound().unwrap().handler.protocol(),
            Protocol::Nullary
        );
    }

    #[tokio::test]
    async fn test_concurrent_attempts_bind_once() {
        let specializer = Arc::new(specializer());
        let request = SpecializeRequest::Static {
            module_path: "function/handler".into(),
            entrypoint: Some("main".into()),
        };
        let a = tokio::spawn({
            let s = specializer.clone();
            let r = request.clone();
            async move { s.specialize(r).await.is_ok() }
        });
        let b = tokio::spawn({
            let s = specializer.clone();
            async move { s.specialize(request).await.is_ok() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b);
    }

    struct SlowResolver;

    impl ModuleResolver for SlowResolver {
        fn resolve(&self, _path: &str, _entry: Option<&str>) -> Result<Option<Handler>, LoadError> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Ok(Some(Handler::nullary(|| async { Ok(None) })))
        }
    }

    #[tokio::test]
    async fn test_cancelled_load_returns_to_generic() {
        let specializer = Specializer::new(FunctionLoader::new().with_resolver(SlowResolver));
        let mut attempt = Box::pin(specializer.specialize(SpecializeRequest::Static {
            module_path: "function/handler".into(),
            entrypoint: None,
        }));

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), attempt.as_mut()).await;
        assert!(cancelled.is_err());
        assert_eq!(specializer.state(), SpecializationState::Specializing);

        drop(attempt);
        assert_eq!(specializer.state(), SpecializationState::Generic);
        assert!(specializer.bound().is_none());
    }
}
