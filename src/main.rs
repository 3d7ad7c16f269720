//! fnhost - function host server
//!
//! Serves a built-in demo module at `./function/handler`, and any dynamic
//! library module reachable from the working directory.

use fnhost::function::DylibResolver;
use fnhost::prelude::*;
use tracing_subscriber::EnvFilter;

/// Greets the caller and reports the invocation context.
#[export(name = "main")]
async fn hello(event: Event, context: FunctionContext) -> FunctionResult {
    let name = event.get_header("x-name").unwrap_or("World").to_string();
    Ok(Some(Reply::ok(json!({
        "message": format!("Hello, {}!", name),
        "method": event.method,
        "path": event.path,
        "function": context.function_name,
    }))))
}

/// Echoes the request body through the callback.
#[export(name = "echo")]
fn echo(
    event: Event,
    _context: FunctionContext,
    callback: Callback,
) -> Result<Returned, FunctionError> {
    callback.send(200, event.text().unwrap_or_default());
    Ok(Returned::Nothing)
}

/// Echoes every text message of a WebSocket session.
#[export(name = "realtime", protocol = "session")]
async fn realtime(mut session: Session, _context: FunctionContext) -> Result<(), FunctionError> {
    while let Some(message) = session.recv().await {
        if let SessionMessage::Text(text) = message {
            if !session.send_text(text) {
                break;
            }
        }
    }
    Ok(())
}

fn demo_module() -> Module {
    Module::new()
        .default_export(HelloExport::handler())
        .export(HelloExport::NAME, HelloExport::handler())
        .export(EchoExport::NAME, EchoExport::handler())
        .export(RealtimeExport::NAME, RealtimeExport::handler())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Panics in detached work are logged; the process keeps serving.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!("Uncaught panic: {}", info);
    }));

    let config = HostConfig::from_env()?;
    tracing::info!(
        "Starting function host '{}' ({})",
        config.resolved_function_name(),
        config.tracing_service_name()
    );

    let loader = FunctionLoader::new()
        .with_resolver(ModuleTable::new().with_module("function/handler", demo_module()))
        .with_resolver(DylibResolver::new());

    tracing::info!("Try: curl http://localhost:{}/hello", config.port);
    tracing::info!("Health check: curl http://localhost:{}/healthz", config.port);

    FunctionServer::new(Host::new(config, loader)).run().await
}
