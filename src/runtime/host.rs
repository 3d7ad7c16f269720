//! The host context: everything a request handler needs, built once per
//! process.

use crate::function::{
    BoundFunction, FunctionContext, FunctionLoader, SpecializeError, SpecializeRequest,
    Specializer,
};
use crate::runtime::activity::{ActivityNotifier, HttpActivityNotifier, LogActivityNotifier};
use crate::runtime::config::HostConfig;
use crate::runtime::connections::ConnectionTracker;
use crate::runtime::sessions::SessionTracker;
use crate::runtime::telemetry::{SpanTracer, Tracer};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    specializer: Specializer,
    connections: Arc<ConnectionTracker>,
    sessions: Arc<SessionTracker>,
    tracer: Arc<dyn Tracer>,
}

impl Host {
    /// Build a host that loads its function through `loader`.
    pub fn new(config: HostConfig, loader: FunctionLoader) -> Self {
        let tracer: Arc<dyn Tracer> = Arc::new(SpanTracer::new(config.tracing_service_name()));
        let notifier = activity_notifier(&config);
        Self {
            specializer: Specializer::new(loader),
            connections: Arc::new(ConnectionTracker::new()),
            sessions: Arc::new(SessionTracker::new(notifier)),
            tracer,
            config,
        }
    }

    /// Replace the tracer handed to user functions.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Replace the session activity notifier.
    pub fn with_activity_notifier(mut self, notifier: Arc<dyn ActivityNotifier>) -> Self {
        self.sessions = Arc::new(SessionTracker::new(notifier));
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn specializer(&self) -> &Specializer {
        &self.specializer
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub fn tracer(&self) -> Arc<dyn Tracer> {
        self.tracer.clone()
    }

    /// Context for one invocation.
    pub fn function_context(&self) -> FunctionContext {
        self.config.function_context(self.tracer.clone())
    }

    /// Bind the module named by the configuration.
    pub async fn specialize_configured(&self) -> Result<Arc<BoundFunction>, SpecializeError> {
        self.specializer
            .specialize(SpecializeRequest::Static {
                module_path: self.config.module_path.clone(),
                entrypoint: self.config.entrypoint.clone(),
            })
            .await
    }

    /// Begin graceful shutdown. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.connections.shutdown();
        let terminated = self.sessions.terminate_all();
        if terminated > 0 {
            info!("Closed {} session(s) for shutdown", terminated);
        }
    }
}

/// The collector notifier when a URL is configured, log-only otherwise or when
/// the HTTP client cannot be built.
fn activity_notifier(config: &HostConfig) -> Arc<dyn ActivityNotifier> {
    let Some(url) = &config.activity_url else {
        return Arc::new(LogActivityNotifier::new(config.service_name()));
    };
    match HttpActivityNotifier::new(url.clone(), config.service_name()) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            warn!("Session activity only logged, collector client failed: {}", err);
            Arc::new(LogActivityNotifier::new(config.service_name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_notifier_follows_config() {
        let logged = activity_notifier(&HostConfig::new());
        assert!(format!("{:?}", logged).starts_with("LogActivityNotifier"));

        let config = HostConfig::new().activity_url("http://collector/activity");
        let posted = activity_notifier(&config);
        assert!(format!("{:?}", posted).starts_with("HttpActivityNotifier"));
    }
}
