use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;

use crate::connection::{ConnectRequest, ConnectionHandle};
use crate::server::Server;
use crate::utils::error::CableError;

pub async fn start_websocket_server(addr: &str, server: Arc<Server>) -> Result<(), CableError> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, server).await
}

/// Accepts sockets on `listener` until it fails.
pub async fn serve(listener: TcpListener, server: Arc<Server>) -> Result<(), CableError> {
    server.start_heartbeat();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        debug!(%peer, "accepted tcp connection");
        tokio::spawn(handle_socket(stream, server.clone()));
    }
}

async fn handle_socket(stream: TcpStream, server: Arc<Server>) {
    let allowed_origins = &server.settings().server.allowed_origins;
    let mut request = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        if !origin_allowed(allowed_origins, origin) {
            warn!(origin = origin.unwrap_or("<none>"), "rejecting websocket from disallowed origin");
            let mut forbidden = ErrorResponse::new(Some("origin not allowed".to_string()));
            *forbidden.status_mut() = StatusCode::FORBIDDEN;
            return Err(forbidden);
        }
        request = Some(connect_request(req));
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some(request) = request else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let handle = ConnectionHandle::new(tx);
    let connection = server.open_connection(request, handle.clone());

    // server -> client; flushes what is queued before closing the socket
    let sender_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = ws_sender.send(msg).await {
                            debug!(connection = %sender_handle.id(), error = %e, "send failed");
                            break;
                        }
                    }
                    None => break,
                },
                _ = sender_handle.closed() => {
                    while let Ok(msg) = rx.try_recv() {
                        if ws_sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        sender_handle.close();
        debug!(connection = %sender_handle.id(), "send loop closed");
    });

    let pool = server.worker_pool().clone();
    let opening = connection.clone();
    let opened = pool
        .run("connection.open", move || opening.lock().on_open())
        .await
        .unwrap_or(false);

    if opened {
        loop {
            let frame = tokio::select! {
                _ = handle.closed() => break,
                frame = ws_receiver.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let target = connection.clone();
                    let text = text.to_string();
                    pool.run("connection.message", move || target.lock().on_message(&text))
                        .await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %handle.id(), error = %e, "read failed");
                    break;
                }
            }
        }
    }

    let closing = connection.clone();
    if pool
        .run("connection.close", move || closing.lock().on_close())
        .await
        .is_none()
    {
        error!(connection = %handle.id(), "connection teardown panicked");
        server.untrack(handle.id());
    }
    handle.close();
}

/// An empty allow-list admits every origin.
pub(crate) fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => allowed.iter().any(|candidate| candidate == "*" || candidate == origin),
        None => false,
    }
}

fn connect_request(req: &Request) -> ConnectRequest {
    let query = req
        .uri()
        .query()
        .map(|query| {
            form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect::<HashMap<String, String>>()
        })
        .unwrap_or_default();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    ConnectRequest {
        path: req.uri().path().to_string(),
        query,
        headers,
    }
}
