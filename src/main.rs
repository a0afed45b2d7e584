use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use gatekeep::config::{Config, Settings};
use gatekeep::domain::ToolRequest;
use gatekeep::error::GateError;
use gatekeep::inference::build_manager;
use gatekeep::observability::init_tracing;
use gatekeep::pattern::{PatternCache, PatternEngine};
use gatekeep::policy::{ConfigWatcher, ErrorPolicy, SecurityPolicyEngine, TracingAuditSink, DEFAULT_POLL_INTERVAL};

/// Reads one JSON `ToolRequest` per line on stdin and writes one JSON
/// `Decision` per line on stdout.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level, config.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting gatekeep");

    let settings = Settings::load(config.settings_path.as_deref()).context("loading settings")?;
    let patterns = PatternEngine::new(Arc::new(PatternCache::new(settings.pattern_cache_capacity)));

    // No in-process sampling backends are linked into the binary
    let inference = build_manager(&settings, Vec::new()).context("configuring inference")?;

    let mut builder = SecurityPolicyEngine::builder()
        .pattern_engine(patterns)
        .audit_sink(Arc::new(TracingAuditSink))
        .rules_path(&config.rules_path);
    if let Some(manager) = inference {
        builder = builder.inference(Arc::new(manager));
    }
    let engine = Arc::new(
        builder
            .build()
            .with_context(|| format!("loading rules from {}", config.rules_path.display()))?,
    );
    info!(
        path = %config.rules_path.display(),
        rules = engine.get_rules_count(),
        "Rules loaded"
    );

    let debounce = config
        .reload_debounce_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or_else(|| settings.reload_debounce());
    let watcher = ConfigWatcher::new(&config.rules_path, engine.clone(), debounce, DEFAULT_POLL_INTERVAL);
    if config.no_watch {
        info!("Rules file watching disabled");
    } else {
        watcher.start();
    }

    tokio::select! {
        result = serve(engine.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "I/O loop failed");
            }
        }
        _ = shutdown_signal() => {}
    }

    info!("Shutting down...");
    watcher.stop();
    info!(metrics = ?engine.metrics().snapshot(), "Shutdown complete");
    Ok(())
}

async fn serve(engine: Arc<SecurityPolicyEngine>) -> anyhow::Result<()> {
    let fallback = ErrorPolicy::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let decision = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => engine.evaluate_and_audit(&request).await,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed request");
                fallback.decision_for(&GateError::InvalidRequest(e.to_string()))
            }
        };

        let mut out = serde_json::to_vec(&decision)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
