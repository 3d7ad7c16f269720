//! Host configuration.

use crate::function::FunctionContext;
use crate::runtime::telemetry::{qualified_service_name, service_name_from_host, Tracer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value '{value}' for {key}: expected {expected}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub expected: &'static str,
}

/// When the host binds its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecializationMode {
    /// Load the configured module at startup.
    #[default]
    Eager,
    /// Wait for a specialization request.
    OnDemand,
}

impl FromStr for SpecializationMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" | "" => Ok(SpecializationMode::Eager),
            "on-demand" | "ondemand" | "lazy" => Ok(SpecializationMode::OnDemand),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SpecializationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecializationMode::Eager => write!(f, "eager"),
            SpecializationMode::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Configuration for the function host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Advisory function timeout in seconds.
    pub timeout_secs: u64,
    /// Pod host name; the service name is derived from it.
    pub host_name: String,
    /// Namespace the function runs in.
    pub namespace: String,
    /// Function name; defaults to the service name.
    pub function_name: Option<String>,
    /// Runtime identifier passed to the function.
    pub runtime: Option<String>,
    /// Memory limit passed to the function.
    pub memory_limit: Option<String>,
    /// Maximum request body size in MiB.
    pub body_limit_mb: f64,
    /// Period of the session liveness sweep.
    pub liveness_interval_ms: u64,
    /// Whether to log every request.
    pub request_logging: bool,
    /// When to bind the function.
    pub specialization: SpecializationMode,
    /// Module loaded at startup or by `/specialize`.
    pub module_path: String,
    /// Export selected from `module_path`.
    pub entrypoint: Option<String>,
    /// Whether to accept WebSocket sessions.
    pub websocket: bool,
    /// Where to post session activity notifications.
    pub activity_url: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout_secs: 180,
            host_name: String::new(),
            namespace: String::new(),
            function_name: None,
            runtime: None,
            memory_limit: None,
            body_limit_mb: 1.0,
            liveness_interval_ms: 60_000,
            request_logging: false,
            specialization: SpecializationMode::Eager,
            module_path: "./function/handler".to_string(),
            entrypoint: Some("main".to_string()),
            websocket: false,
            activity_url: None,
        }
    }
}

impl HostConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`. Unset keys keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FUNC_TIMEOUT") {
            config.timeout_secs = parse("FUNC_TIMEOUT", &v, "a number of seconds")?;
        }
        if let Some(v) = get("HOSTNAME") {
            config.host_name = v;
        }
        if let Some(v) = get("SERVICE_NAMESPACE") {
            config.namespace = v;
        }
        config.function_name = get("FUNC_NAME");
        config.runtime = get("FUNC_RUNTIME");
        config.memory_limit = get("FUNC_MEMORY_LIMIT");
        if let Some(v) = get("REQ_MB_LIMIT") {
            let limit: f64 = parse("REQ_MB_LIMIT", &v, "a size in MiB")?;
            if !limit.is_finite() || limit < 0.0 {
                return Err(invalid("REQ_MB_LIMIT", &v, "a size in MiB"));
            }
            config.body_limit_mb = limit;
        }
        if let Some(v) = get("FUNC_HOST") {
            config.host = v;
        }
        if let Some(v) = get("FUNC_PORT") {
            config.port = parse("FUNC_PORT", &v, "a port number")?;
        }
        if let Some(v) = get("FUNC_LIVENESS_INTERVAL_MS") {
            config.liveness_interval_ms =
                parse("FUNC_LIVENESS_INTERVAL_MS", &v, "a number of milliseconds")?;
            if config.liveness_interval_ms == 0 {
                return Err(invalid("FUNC_LIVENESS_INTERVAL_MS", &v, "a positive interval"));
            }
        }
        config.request_logging =
            lookup("KYMA_INTERNAL_LOGGER_ENABLED").is_some_and(|v| !v.is_empty());
        if let Some(v) = get("FUNC_SPECIALIZATION") {
            config.specialization = v
                .parse()
                .map_err(|_| invalid("FUNC_SPECIALIZATION", &v, "'eager' or 'on-demand'"))?;
        }
        if let Some(v) = get("FUNC_MODULE_PATH") {
            config.module_path = v;
        }
        if let Some(v) = lookup("FUNC_ENTRYPOINT") {
            config.entrypoint = Some(v).filter(|e| !e.trim().is_empty());
        }
        if let Some(v) = get("FUNC_WEBSOCKET_ENABLED") {
            config.websocket = parse_flag("FUNC_WEBSOCKET_ENABLED", &v)?;
        }
        config.activity_url = get("SESSION_ACTIVITY_URL");

        Ok(config)
    }

    /// Set the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the pod host name.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the function name.
    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    /// Set the body limit in MiB.
    pub fn body_limit_mb(mut self, limit: f64) -> Self {
        self.body_limit_mb = limit;
        self
    }

    /// Set the liveness sweep period.
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Enable or disable access logging.
    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    /// Set the specialization mode.
    pub fn specialization(mut self, mode: SpecializationMode) -> Self {
        self.specialization = mode;
        self
    }

    /// Set the static module and entrypoint.
    pub fn module(mut self, path: impl Into<String>, entrypoint: Option<&str>) -> Self {
        self.module_path = path.into();
        self.entrypoint = entrypoint.map(str::to_string);
        self
    }

    /// Enable or disable WebSocket sessions.
    pub fn websocket(mut self, enabled: bool) -> Self {
        self.websocket = enabled;
        self
    }

    /// Set the activity collector endpoint.
    pub fn activity_url(mut self, url: impl Into<String>) -> Self {
        self.activity_url = Some(url.into());
        self
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Service name derived from the pod host name.
    pub fn service_name(&self) -> String {
        service_name_from_host(&self.host_name)
    }

    /// Service name reported by the tracer.
    pub fn tracing_service_name(&self) -> String {
        qualified_service_name(&self.service_name(), &self.namespace)
    }

    /// Function name reported to the user code.
    pub fn resolved_function_name(&self) -> String {
        self.function_name
            .clone()
            .unwrap_or_else(|| self.service_name())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn liveness_period(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }

    /// Maximum request body size in bytes.
    pub fn body_limit_bytes(&self) -> usize {
        (self.body_limit_mb * 1024.0 * 1024.0) as usize
    }

    /// Invocation context template for this host.
    pub fn function_context(&self, tracer: Arc<dyn Tracer>) -> FunctionContext {
        let mut context = FunctionContext::new(self.resolved_function_name(), tracer)
            .with_namespace(self.namespace.clone());
        context.runtime = self.runtime.clone();
        context.memory_limit = self.memory_limit.clone();
        context.timeout = self.timeout();
        context
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn parse<T: FromStr>(key: &str, value: &str, expected: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value, expected))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}
