//! HTTP handlers

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::rejection::WebSocketUpgradeRejection, ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};

use crate::constants::INTENTS_HEADER;
use crate::protocol::{ConnectionInfo, Permissions};
use crate::ui::server::AppState;
use crate::ui::websocket;

const NOT_FOUND_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>404 Not Found</title></head>\
<body><h1>404 Not Found</h1><p>The requested resource was not found.</p></body></html>\n";

/// AND every integer intent mask into the full set; unparseable values are ignored
pub fn parse_intents<'a>(values: impl IntoIterator<Item = &'a str>) -> Permissions {
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|value| value.trim().parse::<u32>().ok())
        .fold(Permissions::ALL, |intents, bits| {
            intents & Permissions::from_bits(bits)
        })
}

fn request_intents(query: &[(String, String)], headers: &HeaderMap) -> Permissions {
    let from_query = query
        .iter()
        .filter(|(key, _)| key == "intents")
        .map(|(_, value)| value.as_str());
    let from_headers = headers
        .get_all(INTENTS_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok());
    parse_intents(from_query.chain(from_headers))
}

/// Protocol endpoint
pub async fn protocol(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        return upgrade_required().await;
    };

    let info = ConnectionInfo {
        is_local: peer.ip().is_loopback(),
        intents: request_intents(&query, &headers),
    };
    tracing::debug!(%peer, intents = ?info.intents, "WebSocket upgrade");

    let handle = state.loop_handle.clone();
    upgrade
        .protocols([state.subprotocol.clone()])
        .on_upgrade(move |socket| websocket::serve(socket, info, handle))
}

pub async fn upgrade_required() -> Response {
    (
        StatusCode::UPGRADE_REQUIRED,
        [(header::UPGRADE, "websocket")],
        "WebSocket upgrade required",
    )
        .into_response()
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE)).into_response()
}
