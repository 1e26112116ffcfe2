//! Web server for deep-link verification

use axum::{
    extract::{Host, Path, Query, State},
    handler::HandlerWithoutStateExt,
    http::{StatusCode, Uri},
    response::{Html, Redirect},
    routing::get,
    BoxError, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use poise::serenity_prelude::UserId;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use super::oauth::OAuthState;
use crate::config::WebSettings;
use crate::events::EventSender;
use crate::managers::Reply;
use crate::messages;
use crate::state::{SharedPendingStore, VerifyToken};

const INVALID_LINK: &str = "Invalid verification link.";

#[derive(Clone, Copy)]
struct Ports {
    http: u16,
    https: u16,
}

/// Shared state for the verification routes
#[derive(Clone)]
pub struct AppState {
    pub oauth: OAuthState,
    pub events: EventSender,
    pub pending: SharedPendingStore,
    pub bot_name: String,
}

/// Query parameters from Discord OAuth callback
#[derive(Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    /// The verify token from the link
    state: String,
    error: Option<String>,
}

pub fn verify_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/verify/:token", get(verify_page))
        .route("/callback", get(oauth_callback))
        .with_state(state)
}

/// Start the web server. Serves HTTPS when both TLS files exist, plain HTTP otherwise
pub async fn start_web_server(config: WebSettings, state: AppState) -> anyhow::Result<()> {
    let redirect_uri = state.oauth.redirect_uri();
    let app = verify_router(state);

    info!("=== Discord OAuth Configuration ===");
    info!("Add this Redirect URI in Discord Developer Portal: {}", redirect_uri);

    if config.cert_path.exists() && config.key_path.exists() {
        info!("Loading TLS certificates:");
        info!("  Certificate: {}", config.cert_path.display());
        info!("  Private key: {}", config.key_path.display());

        let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
            .await
            .map_err(|e| anyhow::anyhow!(
                "Failed to load TLS certificates: {}\n  Certificate: {}\n  Private key: {}\n\nHint: The private key must be in PKCS#8 PEM format.",
                e, config.cert_path.display(), config.key_path.display()
            ))?;

        tokio::spawn(redirect_http_to_https(Ports {
            http: config.http_port,
            https: config.https_port,
        }));

        let https_addr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
        info!("Web server listening on https://0.0.0.0:{}", config.https_port);

        axum_server::bind_rustls(https_addr, tls_config)
            .serve(app.into_make_service())
            .await?;
    } else {
        warn!(
            "TLS files not found ({}, {}), serving plain HTTP",
            config.cert_path.display(),
            config.key_path.display()
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Web server listening on http://{}", addr);

        axum::serve(listener, app).await?;
    }

    Ok(())
}

/// Redirect all HTTP requests to HTTPS
async fn redirect_http_to_https(ports: Ports) {
    fn make_https(host: &str, uri: Uri, https_port: u16) -> Result<Uri, BoxError> {
        let mut parts = uri.into_parts();

        parts.scheme = Some(axum::http::uri::Scheme::HTTPS);

        if parts.path_and_query.is_none() {
            parts.path_and_query = Some("/".parse()?);
        }

        let authority: axum::http::uri::Authority = host.parse()?;
        let bare_host = authority.host();

        // Only add port if it's not the default HTTPS port
        if https_port == 443 {
            parts.authority = Some(bare_host.parse()?);
        } else {
            parts.authority = Some(format!("{bare_host}:{https_port}").parse()?);
        }

        Ok(Uri::from_parts(parts)?)
    }

    let redirect = move |Host(host): Host, uri: Uri| async move {
        match make_https(&host, uri, ports.https) {
            Ok(uri) => Ok(Redirect::permanent(&uri.to_string())),
            Err(error) => {
                warn!(%error, "Failed to convert URI to HTTPS");
                Err(StatusCode::BAD_REQUEST)
            }
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], ports.http));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind HTTP redirect server on port {}: {}", ports.http, e);
            return;
        }
    };

    info!("HTTP redirect server listening on {}", addr);

    if let Err(e) = axum::serve(listener, redirect.into_make_service()).await {
        error!("HTTP redirect server error: {}", e);
    }
}

/// Health check endpoint
async fn health() -> &'static str {
    "Verification Server Running"
}

/// GET /verify/{token} - landing page of a challenge's deep link
async fn verify_page(State(state): State<AppState>, Path(token): Path<String>) -> Html<String> {
    info!("Verification page requested for token: {}", token);

    let Ok(parsed) = token.parse::<VerifyToken>() else {
        return Html(error_page(INVALID_LINK));
    };

    // Already verified, timed out or never issued
    if state.pending.get(parsed.member_id).is_none() {
        return Html(error_page(&messages::reply_message(
            Reply::NotFound,
            &state.bot_name,
        )));
    }

    Html(login_page(&state.bot_name, &state.oauth.authorize_url(&token)))
}

/// GET /callback - OAuth callback handler
async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Html<String>, Html<String>> {
    if let Some(reason) = params.error {
        warn!("OAuth authorization denied for {}: {}", params.state, reason);
        return Err(Html(error_page("Discord login was cancelled.")));
    }
    let token = params.state.parse::<VerifyToken>().map_err(|_| {
        warn!("OAuth callback with invalid state: {}", params.state);
        Html(error_page(INVALID_LINK))
    })?;
    let code = params
        .code
        .ok_or_else(|| Html(error_page("Missing authorization code.")))?;

    info!("OAuth callback received for token: {}", params.state);

    let discord_user = state.oauth.fetch_user(&code).await.map_err(|e| {
        error!("{}", e);
        Html(error_page("Could not confirm your Discord account."))
    })?;

    let requester: u64 = discord_user
        .id
        .parse()
        .map_err(|_| Html(error_page("Invalid Discord user ID")))?;

    info!(
        "User authenticated: {} ({})",
        discord_user.username, discord_user.id
    );

    let reply = state
        .events
        .verify(UserId::new(requester), token.to_string())
        .await
        .map_err(|e| {
            error!("Verify attempt from {} failed: {}", requester, e);
            Html(error_page(&messages::internal_error_message()))
        })?;

    let text = messages::reply_message(reply, &state.bot_name);
    match reply {
        Reply::Success => Ok(Html(success_page(
            discord_user
                .global_name
                .as_deref()
                .unwrap_or(&discord_user.username),
            &text,
        ))),
        _ => Err(Html(error_page(&text))),
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, gradient: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, {gradient});
        }}
        .container {{
            background: white;
            padding: 40px;
            border-radius: 16px;
            box-shadow: 0 10px 40px rgba(0,0,0,0.2);
            text-align: center;
            max-width: 400px;
        }}
        .discord-btn {{
            display: inline-block;
            background: #5865F2;
            color: white;
            padding: 15px 30px;
            border-radius: 8px;
            text-decoration: none;
            font-weight: 600;
            font-size: 16px;
        }}
        .hint {{
            color: #888;
            font-size: 14px;
        }}
    </style>
</head>
<body>
    <div class="container">
{body}
    </div>
</body>
</html>"#,
        title = title,
        gradient = gradient,
        body = body
    )
}

fn login_page(bot_name: &str, oauth_url: &str) -> String {
    page(
        "Verify Your Account",
        "#667eea 0%, #764ba2 100%",
        &format!(
            r#"        <h1>Verify Your Account</h1>
        <p>{} needs to confirm it is you before you can chat.</p>
        <a href="{}" class="discord-btn">Login with Discord</a>"#,
            escape_html(bot_name),
            escape_html(oauth_url)
        ),
    )
}

fn success_page(display_name: &str, text: &str) -> String {
    page(
        "Verification Success",
        "#11998e 0%, #38ef7d 100%",
        &format!(
            r#"        <h1>Welcome, {}!</h1>
        <p>{}</p>
        <p class="hint">You can now close this window and check Discord.</p>"#,
            escape_html(display_name),
            escape_html(text)
        ),
    )
}

fn error_page(message: &str) -> String {
    page(
        "Verification Error",
        "#f093fb 0%, #f5576c 100%",
        &format!(
            r#"        <h1>Verification Failed</h1>
        <p>{}</p>
        <p class="hint">Please try again or contact an administrator.</p>"#,
            escape_html(message)
        ),
    )
}
