//! chatrelay server: wires the messaging session, router and pages together.

use crate::config::RelayConfig;
use crate::conversation::ConversationStore;
use crate::external::HttpServices;
use crate::lifecycle::SessionLifecycle;
use crate::router::MessageRouter;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use relay_channels::{BridgeSession, MessagingSession};
use relay_llm::LlmClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct RelayState {
    pub base_url: String,
    pub model: String,
    pub lifecycle: Arc<SessionLifecycle>,
    pub qr_wait: Duration,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let llm = build_llm_client(&cfg)?;
    tracing::info!(
        model = %llm.model(),
        completion_url = %llm.endpoint(),
        api_key_configured = llm.has_api_key(),
        bind_addr = %cfg.bind_addr()?,
        base_url = %cfg.base_url(),
        bridge_url = %cfg.session.bridge_url,
        bridge_token_configured = cfg.session.bridge_token.is_some(),
        max_turns = cfg.conversation.max_turns,
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    let base_url = cfg.base_url();
    let llm = build_llm_client(&cfg)?;
    tracing::info!(
        bind_addr = %addr,
        base_url = %base_url,
        model = %llm.model(),
        api_key_configured = llm.has_api_key(),
        bridge_url = %cfg.session.bridge_url,
        qr_wait_seconds = cfg.server.qr_wait_seconds,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        max_turns = cfg.conversation.max_turns,
        "chatrelay starting"
    );
    if !llm.has_api_key() {
        tracing::warn!("OPENAI_API_KEY is not set; conversation replies will fail");
    }

    let listener = preflight_bind_listener(addr).await?;
    let shutdown = CancellationToken::new();

    let services = HttpServices::new(
        llm,
        &cfg.services.joke_url,
        &cfg.services.quote_url,
        Duration::from_secs(cfg.services.timeout_seconds),
    )?
    .with_system_prompt(cfg.general.system_prompt.clone());
    let router = Arc::new(MessageRouter::new(
        ConversationStore::new(cfg.conversation.max_turns),
        Arc::new(services),
    ));

    let transport: Arc<dyn MessagingSession> = Arc::new(
        BridgeSession::new(&cfg.session.bridge_url)?
            .with_auth_token(cfg.session.bridge_token.clone())
            .with_poll_interval(Duration::from_millis(cfg.session.poll_interval_ms))
            .with_max_poll_failures(cfg.session.max_poll_failures)
            .with_shutdown(shutdown.child_token()),
    );
    let lifecycle = SessionLifecycle::new(
        transport.clone(),
        router,
        Duration::from_millis(cfg.session.challenge_check_interval_ms),
        format!("{base_url}/qr"),
    );

    if cfg.session.initialize_on_startup {
        if let Err(error) = lifecycle.ensure_initialized().await {
            tracing::warn!(%error, "messaging session not started; /qr will retry");
        }
    }

    let state = Arc::new(RelayState {
        base_url: base_url.clone(),
        model: cfg.general.model.clone(),
        lifecycle,
        qr_wait: cfg.qr_wait(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.server.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, qr_url = %format!("{base_url}/qr"), "chatrelay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    transport.shutdown().await;
    tracing::info!(session = %transport.session_id(), "messaging session shutdown completed");
    Ok(())
}

fn build_llm_client(cfg: &RelayConfig) -> Result<LlmClient> {
    Ok(LlmClient::new(cfg.openai_api_key(), &cfg.general.model)?
        .with_endpoint(&cfg.services.completion_url)?
        .with_timeout(Duration::from_secs(cfg.services.timeout_seconds)))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
