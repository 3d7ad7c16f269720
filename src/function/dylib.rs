//! Dynamic-library modules loaded with `libloading`.
//!
//! A library exports one or more functions with the C signature
//! `extern "C" fn(WireSlice) -> WireOwned` and a matching
//! `fnhost_free(WireOwned)`. The request is a JSON document
//! `{"event": ..., "context": ...}`; the response is a JSON [`Reply`].

use crate::function::handler::{FunctionContext, FunctionError, Handler};
use crate::function::loader::{LoadError, ModuleResolver};
use crate::http::{Event, Reply};
use libloading::{Library, Symbol};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Symbol used when no entrypoint is requested.
pub const DEFAULT_EXPORT: &str = "fnhost_main";
/// Symbol that releases buffers returned by an export.
pub const FREE_SYMBOL: &str = "fnhost_free";

/// Borrowed input buffer.
#[repr(C)]
pub struct WireSlice {
    pub ptr: *const u8,
    pub len: usize,
}

/// Buffer allocated by the library and released with `fnhost_free`.
#[repr(C)]
pub struct WireOwned {
    pub ptr: *mut u8,
    pub len: usize,
}

impl WireOwned {
    /// Hand `bytes` across the boundary. Library authors pair this with
    /// [`WireOwned::free`] in their `fnhost_free` export.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let mut boxed = bytes.into_boxed_slice();
        let owned = WireOwned {
            ptr: boxed.as_mut_ptr(),
            len: boxed.len(),
        };
        std::mem::forget(boxed);
        owned
    }

    /// Release a buffer created by [`WireOwned::from_vec`].
    ///
    /// # Safety
    /// `self` must come from `from_vec` and must not be freed twice.
    pub unsafe fn free(self) {
        if self.ptr.is_null() {
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr, self.len);
        drop(Box::from_raw(slice));
    }
}

type HandleFn = unsafe extern "C" fn(WireSlice) -> WireOwned;
type FreeFn = unsafe extern "C" fn(WireOwned);

#[derive(Serialize)]
struct WireRequest<'a> {
    event: &'a Event,
    context: &'a FunctionContext,
}

/// A resolved export. Keeps its library loaded for as long as the handler
/// lives.
struct DylibExport {
    _library: Arc<Library>,
    handle: HandleFn,
    free: FreeFn,
}

impl DylibExport {
    fn call(&self, event: &Event, context: &FunctionContext) -> Result<Reply, FunctionError> {
        let request = serde_json::to_vec(&WireRequest { event, context })
            .map_err(|e| FunctionError::with_status(500, e.to_string()))?;
        let response = unsafe { call_export(self.handle, self.free, &request)? };
        decode_reply(&response)
    }
}

/// Call `handle` with `request` and copy the result out before freeing it.
///
/// # Safety
/// `handle` and `free` must follow the wire ABI.
unsafe fn call_export(
    handle: HandleFn,
    free: FreeFn,
    request: &[u8],
) -> Result<Vec<u8>, FunctionError> {
    let owned = handle(WireSlice {
        ptr: request.as_ptr(),
        len: request.len(),
    });

    if owned.ptr.is_null() && owned.len != 0 {
        return Err(FunctionError::with_status(
            500,
            "library export returned a null pointer",
        ));
    }

    let bytes = if owned.len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(owned.ptr, owned.len).to_vec()
    };
    free(owned);
    Ok(bytes)
}

fn decode_reply(bytes: &[u8]) -> Result<Reply, FunctionError> {
    if bytes.is_empty() {
        return Err(FunctionError::with_status(
            500,
            "library export returned an empty response",
        ));
    }
    serde_json::from_slice(bytes).map_err(|e| {
        FunctionError::with_status(500, format!("invalid response from library: {}", e))
    })
}

/// Resolves module paths to dynamic libraries on disk.
#[derive(Debug, Clone, Default)]
pub struct DylibResolver {
    base: Option<PathBuf>,
}

impl DylibResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative module paths against `base`.
    pub fn with_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Paths tried for `module_path`: as given, then with the platform
    /// library extension, then with the `lib` prefix as well.
    fn candidates(&self, module_path: &str) -> Vec<PathBuf> {
        let path = match &self.base {
            Some(base) if Path::new(module_path).is_relative() => base.join(module_path),
            _ => PathBuf::from(module_path),
        };
        let mut candidates = vec![path.clone()];
        if path.extension().is_none() {
            candidates.push(path.with_extension(std::env::consts::DLL_EXTENSION));
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let prefixed = format!(
                    "{}{}.{}",
                    std::env::consts::DLL_PREFIX,
                    name,
                    std::env::consts::DLL_EXTENSION
                );
                candidates.push(path.with_file_name(prefixed));
            }
        }
        candidates
    }

    fn open(&self, path: &Path, module_path: &str, symbol: &str) -> Result<Handler, LoadError> {
        debug!("Loading library {:?} for symbol '{}'", path, symbol);
        let library = unsafe { Library::new(path) }.map_err(|source| LoadError::Library {
            path: module_path.to_string(),
            source,
        })?;

        let handle: HandleFn = unsafe {
            let sym: Symbol<HandleFn> =
                library
                    .get(symbol.as_bytes())
                    .map_err(|_| LoadError::ExportNotFound {
                        path: module_path.to_string(),
                        name: symbol.to_string(),
                    })?;
            *sym
        };
        let free: FreeFn = unsafe {
            let sym: Symbol<FreeFn> =
                library
                    .get(FREE_SYMBOL.as_bytes())
                    .map_err(|_| LoadError::ExportNotFound {
                        path: module_path.to_string(),
                        name: FREE_SYMBOL.to_string(),
                    })?;
            *sym
        };

        let export = Arc::new(DylibExport {
            _library: Arc::new(library),
            handle,
            free,
        });

        Ok(Handler::event_context(move |event, context| {
            let export = export.clone();
            async move {
                tokio::task::spawn_blocking(move || export.call(&event, &context))
                    .await
                    .map_err(|e| FunctionError::with_status(500, e.to_string()))?
                    .map(Some)
            }
        }))
    }
}

impl ModuleResolver for DylibResolver {
    fn resolve(
        &self,
        module_path: &str,
        entrypoint: Option<&str>,
    ) -> Result<Option<Handler>, LoadError> {
        let symbol = entrypoint.unwrap_or(DEFAULT_EXPORT);
        match self.candidates(module_path).into_iter().find(|p| p.is_file()) {
            Some(path) => self.open(&path, module_path, symbol).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    unsafe extern "C" fn echo_path(input: WireSlice) -> WireOwned {
        let bytes = std::slice::from_raw_parts(input.ptr, input.len);
        let request: Value = serde_json::from_slice(bytes).unwrap();
        let reply = json!({
            "status": 200,
            "body": {
                "path": request["event"]["path"],
                "function": request["context"]["function-name"],
            },
            "headers": {"x-lib": "yes"},
        });
        WireOwned::from_vec(serde_json::to_vec(&reply).unwrap())
    }

    unsafe extern "C" fn empty(_input: WireSlice) -> WireOwned {
        WireOwned {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    unsafe extern "C" fn free(owned: WireOwned) {
        owned.free();
    }

    #[test]
    fn test_call_export_round_trips_json() {
        let tracer = Arc::new(crate::runtime::telemetry::SpanTracer::new("test"));
        let context = FunctionContext::new("orders", tracer);
        let event = Event::new("GET", "/orders");
        let request = serde_json::to_vec(&WireRequest {
            event: &event,
            context: &context,
        })
        .unwrap();

        let response = unsafe { call_export(echo_path, free, &request).unwrap() };
        let reply = decode_reply(&response).unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, json!({"path": "/orders", "function": "orders"}));
        assert_eq!(reply.headers["x-lib"], "yes");
    }

    #[test]
    fn test_empty_response_is_an_error() {
        let response = unsafe { call_export(empty, free, b"{}").unwrap() };
        let err = decode_reply(&response).unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_candidates_append_platform_extension() {
        let resolver = DylibResolver::new().with_base("/srv");
        let candidates = resolver.candidates("function/handler");
        assert_eq!(candidates[0], PathBuf::from("/srv/function/handler"));
        assert_eq!(candidates.len(), 3);
        assert!(candidates[2]
            .to_string_lossy()
            .ends_with(std::env::consts::DLL_EXTENSION));

        assert_eq!(resolver.candidates("/abs/lib.so").len(), 1);
    }

    #[test]
    fn test_missing_library_is_not_resolved() {
        let resolver = DylibResolver::new();
        assert!(resolver
            .resolve("/definitely/not/here", None)
            .unwrap()
            .is_none());
    }
}
