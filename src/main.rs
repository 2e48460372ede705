use std::sync::Arc;

use ai_delegate::agent::{CommandAgent, Runtime};
use ai_delegate::channels::{ChannelManager, CliChannel, TelegramChannel, WebChannel};
use ai_delegate::config::RelayConfig;
use ai_delegate::llm::{PreviewSummarizer, Summarizer, SummarizerBackend, create_summarizer};
use ai_delegate::queue::JobQueue;
use ai_delegate::render::BroadcastRenderer;
use ai_delegate::server::{self, AppState};
use ai_delegate::tools::{ToolRegistry, register_builtin_tools};
use ai_delegate::worker::RenderJobHandler;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    // The console target redraws the terminal, so logs go to a file while it
    // is active. The guard flushes the file writer on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("🤖 AI Delegate v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Frames WS: ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   Jobs API: http://0.0.0.0:{}/api/jobs", config.port);
    if config.console {
        eprintln!("   Logs: {}", config.log_dir.display());
    }

    // ── Summarizer ──────────────────────────────────────────────────────
    let summarizer: Arc<dyn Summarizer> = match create_summarizer(&config.summarizer) {
        Ok(summarizer) => summarizer,
        Err(e) => {
            eprintln!("   Warning: summarizer unavailable ({e}); using previews");
            Arc::new(PreviewSummarizer)
        }
    };
    eprintln!(
        "   Summaries: {}",
        match config.summarizer.backend {
            SummarizerBackend::Anthropic => config.summarizer.model.as_str(),
            SummarizerBackend::Preview => "local preview",
        }
    );

    // ── Tools + runtime ─────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools).await;
    eprintln!("   Tools: {}", tools.list().await.join(", "));
    let runtime = Runtime::new(tools, config.runtime);

    // ── Channels ────────────────────────────────────────────────────────
    let frames = BroadcastRenderer::new();
    let web = WebChannel::new(frames.clone());
    let submitter = web.submitter();

    let mut channels = ChannelManager::new();
    channels.add(Box::new(if config.console {
        CliChannel::new()
    } else {
        CliChannel::plain()
    }));
    channels.add(Box::new(web));

    if let Some(telegram) = &config.telegram {
        eprintln!(
            "   Telegram: enabled (allowed: {})",
            if telegram.allowed_users.iter().any(|u| u == "*") {
                "everyone".to_string()
            } else {
                telegram.allowed_users.join(", ")
            }
        );
        channels.add(Box::new(TelegramChannel::new(
            telegram.bot_token.clone(),
            telegram.allowed_users.clone(),
            telegram.limits,
        )));
    }
    eprintln!("   Channels: {}\n", channels.names().join(", "));
    let channels = Arc::new(channels);

    // ── Queue ───────────────────────────────────────────────────────────
    let handler = RenderJobHandler::new(
        Arc::new(CommandAgent::default()),
        runtime,
        Arc::clone(&summarizer),
        Arc::clone(&channels),
    )
    .with_observer(Arc::new(frames.clone()));

    let queue = JobQueue::builder()
        .handler(Arc::new(handler))
        .reporter(channels.clone())
        .summarizer(summarizer)
        .build()?;

    // ── HTTP/WS server ──────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    let app = server::router(AppState {
        queue: Arc::clone(&queue),
        submitter,
        frames,
    });
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP/WS server stopped");
        }
    });

    eprintln!("   Type a request and press Enter (use ;; for a new line). Ctrl-C to exit.\n");

    let incoming = channels.start_all().await?;
    for (name, health) in channels.health().await {
        match health {
            Ok(()) => tracing::info!(channel = %name, "Channel ready"),
            Err(e) => tracing::warn!(channel = %name, error = %e, "Channel health check failed"),
        }
    }
    tokio::select! {
        _ = queue.admit(incoming) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    channels.shutdown_all().await;
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(config: &RelayConfig) -> Option<WorkerGuard> {
    if config.console {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "ai-delegate.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}
