use std::collections::BTreeSet;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::client::monitor::{ConnectionMonitor, MonitorAction, MonitorConfig};
use crate::transport::message::{Frame, ServerMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Perform { identifier: String, data: Value },
    Close,
}

enum SessionEnd {
    /// Socket went away; reconnect when the monitor allows.
    Dropped,
    /// Closed on purpose; stop for good.
    Finished,
}

/// A reconnecting client for one cable endpoint.
///
/// Subscriptions survive reconnects: they are replayed on every new socket.
/// Everything the server sends except pings comes out of
/// [`next_frame`](Consumer::next_frame).
pub struct Consumer {
    commands: mpsc::UnboundedSender<Command>,
    frames: mpsc::UnboundedReceiver<Frame>,
    task: JoinHandle<()>,
}

impl Consumer {
    pub fn connect(url: impl Into<String>, config: MonitorConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(url.into(), config, command_rx, frame_tx));
        Self {
            commands,
            frames,
            task,
        }
    }

    pub fn subscribe(&self, identifier: impl Into<String>) {
        let _ = self.commands.send(Command::Subscribe(identifier.into()));
    }

    pub fn unsubscribe(&self, identifier: impl Into<String>) {
        let _ = self.commands.send(Command::Unsubscribe(identifier.into()));
    }

    /// Calls `action` on a subscribed channel. Non-object `data` is sent
    /// under a `data` key.
    pub fn perform(&self, identifier: impl Into<String>, action: &str, data: Value) {
        let mut object = match data {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            other => Map::from_iter([("data".to_string(), other)]),
        };
        object.insert("action".to_string(), Value::String(action.to_string()));
        let _ = self.commands.send(Command::Perform {
            identifier: identifier.into(),
            data: Value::Object(object),
        });
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Closes the socket and waits for the background task to finish.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }
}

async fn run(
    url: String,
    config: MonitorConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::UnboundedSender<Frame>,
) {
    let mut ticker = tokio::time::interval(config.check_interval);
    let mut monitor = ConnectionMonitor::new(config);
    let mut subscriptions = BTreeSet::new();
    monitor.start(Instant::now());

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %url, "connected");
                let end = session(
                    socket,
                    &mut monitor,
                    &mut subscriptions,
                    &mut commands,
                    &frames,
                    &mut ticker,
                )
                .await;
                if let SessionEnd::Finished = end {
                    info!(url = %url, "consumer closed");
                    return;
                }
            }
            Err(e) => warn!(url = %url, error = %e, "connect failed"),
        }
        monitor.record_disconnect(Instant::now());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if monitor.check(Instant::now(), false) == MonitorAction::Reopen {
                        debug!(attempts = monitor.reconnect_attempts(), "reconnecting");
                        break;
                    }
                }
                command = commands.recv() => match command {
                    None | Some(Command::Close) => return,
                    Some(Command::Perform { identifier, .. }) => {
                        warn!(identifier = %identifier, "not connected; dropping action");
                    }
                    // replayed by the next session
                    Some(command) => {
                        wire_command(&mut subscriptions, command);
                    }
                },
            }
        }
    }
}

async fn session(
    socket: Socket,
    monitor: &mut ConnectionMonitor,
    subscriptions: &mut BTreeSet<String>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    frames: &mpsc::UnboundedSender<Frame>,
    ticker: &mut Interval,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    for identifier in subscriptions.iter() {
        let command = json!({ "command": "subscribe", "identifier": identifier });
        if sink.send(WsMessage::text(command.to_string())).await.is_err() {
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: Frame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "undecodable frame from server");
                            continue;
                        }
                    };
                    let now = Instant::now();
                    let mut finished = false;
                    match &frame {
                        Frame::Control(ServerMessage::Ping { .. }) => {
                            monitor.record_ping(now);
                            continue;
                        }
                        Frame::Control(ServerMessage::Welcome) => monitor.record_connect(now),
                        Frame::Control(ServerMessage::Rejection { identifier }) => {
                            subscriptions.remove(identifier);
                        }
                        Frame::Control(ServerMessage::Disconnect { reason, reconnect }) => {
                            info!(reason = %reason, reconnect, "server asked to disconnect");
                            if !reconnect {
                                monitor.stop(now);
                                finished = true;
                            }
                        }
                        _ => {}
                    }
                    if frames.send(frame).is_err() || finished {
                        return SessionEnd::Finished;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "read failed");
                    return SessionEnd::Dropped;
                }
            },
            command = commands.recv() => match command {
                None | Some(Command::Close) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SessionEnd::Finished;
                }
                Some(command) => {
                    if let Some(wire) = wire_command(subscriptions, command) {
                        if sink.send(WsMessage::text(wire.to_string())).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                }
            },
            _ = ticker.tick() => {
                if monitor.check(Instant::now(), true) == MonitorAction::Reopen {
                    warn!("connection is stale; reopening");
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

/// Applies `command` to the subscription set and returns what to send.
fn wire_command(subscriptions: &mut BTreeSet<String>, command: Command) -> Option<Value> {
    match command {
        Command::Subscribe(identifier) => {
            subscriptions.insert(identifier.clone());
            Some(json!({ "command": "subscribe", "identifier": identifier }))
        }
        Command::Unsubscribe(identifier) => {
            subscriptions.remove(&identifier);
            Some(json!({ "command": "unsubscribe", "identifier": identifier }))
        }
        Command::Perform { identifier, data } => Some(json!({
            "command": "message",
            "identifier": identifier,
            "data": data.to_string(),
        })),
        Command::Close => None,
    }
}
