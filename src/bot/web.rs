//! Process-wide HTTP router.
//!
//! Plugins mount sub-routers before the kernel starts; the kernel serves
//! them all from one bind address, together with `GET /nav` (the index of
//! plugins that registered a display name) and a minimal HTML index.
//! Privileged routes opt in to the Basic-Auth admin gate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::bot::Bot;
use crate::error::BotError;

/// One `/nav` entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NavEntry {
    pub name: String,
    pub url: String,
}

/// Routes collected during plugin registration, mounted at serve time.
#[derive(Default)]
pub struct WebRegistry {
    routes: Vec<(String, Router)>,
    nav: Vec<NavEntry>,
}

impl WebRegistry {
    pub fn mount(&mut self, path: &str, router: Router, display_name: Option<&str>) {
        if let Some(name) = display_name {
            self.nav.push(NavEntry {
                name: name.to_string(),
                url: path.to_string(),
            });
        }
        self.routes.push((path.to_string(), router));
    }

    pub fn nav(&self) -> &[NavEntry] {
        &self.nav
    }
}

/// JSON error body used by every auth and validation failure.
pub fn web_err(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "err": msg.into() }))).into_response()
}

/// HTTP Basic gate for privileged endpoints. The password is verified
/// against the bcrypt-hashed `admin` scope; the username against
/// `bot.admin_user` in constant time.
pub async fn admin_gate(
    State(bot): State<Arc<Bot>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .is_some_and(|creds| match creds.split_once(':') {
            Some((user, pass)) => {
                let want_user = bot.config().get("bot.admin_user", "admin");
                let user_ok = bool::from(user.as_bytes().ct_eq(want_user.as_bytes()));
                user_ok && bot.check_password("admin", pass)
            }
            None => false,
        });

    if authorized {
        next.run(request).await
    } else {
        web_err(StatusCode::UNAUTHORIZED, "admin auth required")
    }
}

/// Wrap a plugin router with the admin gate.
pub fn require_admin(bot: Arc<Bot>, router: Router) -> Router {
    router.layer(middleware::from_fn_with_state(bot, admin_gate))
}

/// Assemble the full router and serve it until shutdown.
pub(crate) async fn serve(
    bot: Arc<Bot>,
    registry: WebRegistry,
    addr: SocketAddr,
) -> Result<(), BotError> {
    let app = build_router(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "web server listening");

    let mut shutdown = bot.shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

pub(crate) fn build_router(registry: WebRegistry) -> Router {
    let nav = registry.nav.clone();
    let nav_for_index = nav.clone();

    let mut app = Router::new()
        .route("/nav", get(move || async move { Json(nav.clone()) }))
        .route(
            "/",
            get(move || async move {
                let items: String = nav_for_index
                    .iter()
                    .map(|e| format!("<li><a href=\"{}\">{}</a></li>", e.url, e.name))
                    .collect();
                Html(format!("<html><body><ul>{items}</ul></body></html>"))
            }),
        );
    for (path, router) in registry.routes {
        app = app.nest(&path, router);
    }
    app.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nav_records_only_named_mounts() {
        let mut reg = WebRegistry::default();
        reg.mount("/counter", Router::new(), Some("Counter"));
        reg.mount("/hooks/github", Router::new(), None);
        assert_eq!(reg.nav().len(), 1);
        assert_eq!(reg.nav()[0].name, "Counter");
        assert_eq!(reg.nav()[0].url, "/counter");
    }

    #[test]
    fn nav_entry_serializes_as_name_url() {
        let entry = NavEntry {
            name: "Counter".to_string(),
            url: "/counter".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"name": "Counter", "url": "/counter"}));
    }
}
