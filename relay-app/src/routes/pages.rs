use crate::lifecycle::{ChallengeOutcome, PendingChallenge};
use crate::qr;
use crate::server::RelayState;
use axum::Extension;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/", get(get_index))
        .route("/qr", get(get_qr))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_index(Extension(state): Extension<Arc<RelayState>>) -> Html<String> {
    let qr_url = escape_html(&format!("{}/qr", state.base_url));
    Html(page(
        "chatrelay",
        &format!(
            "<h1>Welcome to chatrelay</h1>\n\
             <p>This bot relays chat messages to the {model} completion model.</p>\n\
             <p>To authenticate, please navigate to <a href=\"/qr\">{qr_url}</a> \
             to scan the QR code with your messaging app.</p>",
            model = escape_html(&state.model),
        ),
    ))
}

#[tracing::instrument(level = "info", skip_all)]
async fn get_qr(Extension(state): Extension<Arc<RelayState>>) -> (StatusCode, Html<String>) {
    match state.lifecycle.await_challenge(state.qr_wait).await {
        Ok(ChallengeOutcome::AlreadyAuthenticated) => (
            StatusCode::OK,
            Html(page(
                "Already authenticated",
                "<h1>Already authenticated</h1>\n\
                 <p>The messaging session is logged in. There is no QR code to scan.</p>",
            )),
        ),
        Ok(ChallengeOutcome::Challenge(challenge)) => render_challenge(&challenge),
        Ok(ChallengeOutcome::TimedOut) => (StatusCode::OK, unavailable_page("Please wait...")),
        Err(error) => {
            tracing::error!(%error, "could not start the messaging session for /qr");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                unavailable_page("The messaging session could not be started. Try again shortly."),
            )
        }
    }
}

fn render_challenge(challenge: &PendingChallenge) -> (StatusCode, Html<String>) {
    let data_url = match qr::challenge_data_url(&challenge.token) {
        Ok(url) => url,
        Err(error) => {
            tracing::error!(%error, "failed to render pairing challenge");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                unavailable_page("The QR code could not be rendered."),
            );
        }
    };
    let issued_at = challenge.issued_at.to_rfc3339();
    (
        StatusCode::OK,
        Html(page(
            "Scan the QR code",
            &format!(
                "<h1>Scan the QR Code with your messaging app</h1>\n\
                 <img src=\"{data_url}\" alt=\"QR Code\" />\n\
                 <p>Issued at <time datetime=\"{issued_at}\">{issued_at}</time>. \
                 Reload this page if it has expired.</p>"
            ),
        )),
    )
}

fn unavailable_page(detail: &str) -> Html<String> {
    Html(page(
        "QR code not available",
        &format!(
            "<h1>QR Code not available</h1>\n<p>{}</p>",
            escape_html(detail)
        ),
    ))
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n{body}\n</body>\n</html>\n",
        escape_html(title)
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
