//! WebSocket upgrade handlers for device and extension channels
//!
//! The upgrade is refused unless the `Origin` header matches the configured
//! allowed origin (any origin when none is configured), and the entity the
//! channel belongs to exists.

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use relay_core::{DeviceId, ExtensionId};
use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::{Connection, InboundHandler};
use crate::http::ApiError;
use crate::hub::Peer;
use crate::state::AppState;
use crate::transport::split_websocket;

fn origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    state.config.origin_allowed(origin)
}

/// WebSocket handler for a mobile device's channel
pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state, &headers) {
        warn!(device = %device_id, "WebSocket upgrade rejected: origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }
    if let Err(e) = state.directory.device(device_id).await {
        return ApiError(e).into_response();
    }

    info!(device = %device_id, "New channel subscriber");
    ws.on_upgrade(move |socket| handle_socket(socket, state, Peer::Device(device_id)))
}

/// WebSocket handler for a browser extension's channel
pub async fn extension_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(extension_id): Path<ExtensionId>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state, &headers) {
        warn!(extension = %extension_id, "WebSocket upgrade rejected: origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }
    if let Err(e) = state.directory.extension(extension_id).await {
        return ApiError(e).into_response();
    }

    info!(extension = %extension_id, "New channel subscriber");
    ws.on_upgrade(move |socket| handle_socket(socket, state, Peer::Extension(extension_id)))
}

/// Run a connection on an upgraded socket until it is torn down
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, peer: Peer) {
    let handler: Arc<dyn InboundHandler> = state.requests.clone();
    let (connection, rx) = Connection::open(
        &state.registry,
        peer,
        handler,
        state.config.connection_lifetime,
    );
    let (reader, writer) = split_websocket(socket);
    connection.serve(reader, writer, rx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_router;
    use crate::push::LogNotifier;
    use futures::{SinkExt, StreamExt};
    use relay_auth::{JsonStore, NewDevice, NewExtension, Platform};
    use relay_core::Config;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};

    const DEVICE_KEY: &str = "MCYBAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4fICEiIyQlJg==";
    const EXTENSION_KEY: &str = "MCYCAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8gISIjJCUmJw==";

    async fn serve(config: Config) -> (Arc<AppState>, std::net::SocketAddr) {
        let state = Arc::new(AppState::new(
            config,
            Arc::new(JsonStore::in_memory()),
            Arc::new(LogNotifier),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, addr)
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: StreamExt<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for event")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_token_relay_end_to_end() {
        let (state, addr) = serve(Config::default()).await;
        let device = state
            .directory
            .register_device(NewDevice {
                name: "Pixel".into(),
                platform: Platform::Android,
                push_token: String::new(),
                public_key: None,
            })
            .await
            .unwrap();
        let extension = state
            .directory
            .register_extension(NewExtension {
                name: "ext".into(),
                browser_name: "firefox".into(),
                browser_version: "120".into(),
                public_key: EXTENSION_KEY.into(),
            })
            .await
            .unwrap();

        let (mut ext_ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/ws/browser_extensions/{}",
            addr, extension.id
        ))
        .await
        .unwrap();
        let (mut device_ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/ws/mobile/devices/{}",
            addr, device.id
        ))
        .await
        .unwrap();

        // wait until both sides are registered
        for _ in 0..50 {
            if state.registry.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        state.pair(device.id, extension.id, DEVICE_KEY, None).await.unwrap();
        let event = next_json(&mut ext_ws).await;
        assert_eq!(event["type"], "pairing_established");
        assert_eq!(event["device_name"], "Pixel");

        let request = state.requests.create(extension.id, "example.com").await.unwrap();
        let event = next_json(&mut device_ws).await;
        assert_eq!(event["type"], "token_requested");
        assert_eq!(event["request_id"], request.id.to_string());
        assert_eq!(event["domain"], "example.com");

        let answer = serde_json::json!({
            "type": "send_token",
            "request_id": request.id,
            "token": "123456"
        });
        device_ws
            .send(Message::Text(answer.to_string().into()))
            .await
            .unwrap();

        let event = next_json(&mut ext_ws).await;
        assert_eq!(event["type"], "token_delivered");
        assert_eq!(event["token"], "123456");
        assert!(state.requests.list_pending(device.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_origin_enforced() {
        let config = Config::default().with_allowed_origin(Some("https://allowed.example".into()));
        let (state, addr) = serve(config).await;
        let device = state
            .directory
            .register_device(NewDevice {
                name: "Pixel".into(),
                platform: Platform::Ios,
                push_token: String::new(),
                public_key: None,
            })
            .await
            .unwrap();
        let url = format!("ws://{}/ws/mobile/devices/{}", addr, device.id);

        let mut request = url.clone().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://evil.example".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_err());

        let mut request = url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://allowed.example".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_device_cannot_connect() {
        let (_, addr) = serve(Config::default()).await;
        let url = format!("ws://{}/ws/mobile/devices/{}", addr, DeviceId::new());
        assert!(tokio_tungstenite::connect_async(url).await.is_err());
    }
}
