//! HTTP server
//!
//! Every path lives under the configured prefix. The protocol path upgrades
//! to a WebSocket (426 without an upgrade); everything else under the prefix
//! is served from the document root.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{handler::HandlerWithoutStateExt, routing::get, Router};
use tower_http::services::ServeDir;

use crate::app::LoopHandle;
use crate::config::ServerConfig;
use crate::ui::handlers;

/// Shared state for request handlers
pub struct AppState {
    pub loop_handle: LoopHandle,
    pub subprotocol: String,
}

/// HTTP / WebSocket server for control clients
pub struct WebServer {
    config: ServerConfig,
    loop_handle: LoopHandle,
}

impl WebServer {
    pub fn new(config: ServerConfig, loop_handle: LoopHandle) -> Self {
        Self {
            config,
            loop_handle,
        }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            loop_handle: self.loop_handle.clone(),
            subprotocol: self.config.subprotocol.clone(),
        });

        let router = Router::new()
            .route(&self.config.websocket_route(), get(handlers::protocol))
            .with_state(state);

        let Some(root) = &self.config.document_root else {
            return router.fallback(handlers::not_found);
        };
        let files = ServeDir::new(root)
            .append_index_html_on_directories(true)
            .not_found_service(handlers::not_found.into_service());

        let prefix = self.config.normalized_prefix();
        if prefix == "/" {
            router.fallback_service(files)
        } else {
            router
                .nest_service(prefix.trim_end_matches('/'), files)
                .fallback(handlers::not_found)
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.config.bind_address).await?;
        tracing::info!(
            "Control protocol at ws://{}{}",
            listener.local_addr()?,
            self.config.websocket_route()
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }

    /// Start the server on a background task
    pub fn start_background<F>(self, shutdown: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = self.serve(shutdown).await {
                tracing::error!("Web server error: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;

    fn server(prefix: &str, document_root: Option<PathBuf>) -> Router {
        let (handle, _events) = LoopHandle::channel();
        let config = ServerConfig {
            prefix: prefix.to_string(),
            document_root,
            ..Default::default()
        };
        WebServer::new(config, handle)
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    async fn get_status(router: Router, uri: &str) -> (StatusCode, Option<String>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let upgrade = response
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        (response.status(), upgrade)
    }

    fn document_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lcc-www-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>mixer</h1>").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_protocol_path_without_upgrade_is_426() {
        let (status, upgrade) = get_status(server("/", None), "/ws").await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
        assert_eq!(upgrade.as_deref(), Some("websocket"));
    }

    #[tokio::test]
    async fn test_unknown_paths_are_404() {
        let (status, _) = get_status(server("/", None), "/index.html").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_files_under_prefix() {
        let root = document_root();
        let (status, _) = get_status(server("/audio", Some(root.clone())), "/audio/index.html").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_status(server("/audio", Some(root.clone())), "/index.html").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_status(server("/audio", Some(root.clone())), "/audio/missing.css").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_status(server("/audio", Some(root)), "/audio/ws").await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn test_static_files_at_root() {
        let (status, _) = get_status(server("/", Some(document_root())), "/").await;
        assert_eq!(status, StatusCode::OK);
    }
}
