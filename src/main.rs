use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use popcable::broker;
use popcable::client::{Consumer, MonitorConfig};
use popcable::config::load_config;
use popcable::connection::internal_channel;
use popcable::transport::websocket::start_websocket_server;
use popcable::utils::error::{CableError, ConnectionRejected};
use popcable::utils::logging;
use popcable::worker_pool::WorkerPool;
use popcable::{
    Channel, ChannelContext, ChannelDescriptor, ConnectRequest, ConnectionHandler, IdentifiedBy,
    Server,
};

#[derive(Parser)]
#[command(name = "popcable", version, about = "Channel subscriptions over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server with the demo chat channel.
    Server,
    /// Connect, join a chat room and print everything received.
    Client {
        #[arg(long, default_value = "ws://127.0.0.1:8080/cable")]
        url: String,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "lobby")]
        room: String,
        /// Say this once subscribed.
        #[arg(long)]
        say: Option<String>,
    },
    /// Disconnect a user's connections on every server sharing the broker.
    Disconnect {
        user: String,
        #[arg(long)]
        reconnect: bool,
    },
}

/// Demo channel: `{"channel": "ChatChannel", "room": "..."}`.
#[derive(Default)]
struct ChatChannel;

impl Channel for ChatChannel {
    fn authorized(&self, ctx: &ChannelContext) -> bool {
        ctx.param_str("room").is_some_and(|room| !room.is_empty())
    }
}

fn room_topic(ctx: &ChannelContext) -> String {
    format!("chat:{}", ctx.param_str("room").unwrap_or_default())
}

fn chat_channel() -> ChannelDescriptor<ChatChannel> {
    ChannelDescriptor::with_default("ChatChannel")
        .on_subscribe(|_, ctx| {
            let topic = room_topic(ctx);
            ctx.stream_from(&topic);
            Ok(())
        })
        .action("speak", |_, ctx, data| {
            let from = ctx.connection().identifier().unwrap_or("anonymous").to_string();
            ctx.broadcast(&room_topic(ctx), &json!({ "from": from, "text": data["text"] }))?;
            Ok(())
        })
}

/// Identifies connections by the `user` query parameter.
struct UserFromQuery;

impl ConnectionHandler for UserFromQuery {
    fn connect(&self, request: &ConnectRequest) -> Result<IdentifiedBy, ConnectionRejected> {
        match request.query_param("user") {
            Some(user) if !user.is_empty() => Ok(IdentifiedBy::new().with("user", user)),
            _ => Err(ConnectionRejected::new("missing `user` query parameter")),
        }
    }

    fn disconnect(&self, identified_by: &IdentifiedBy) {
        info!(user = identified_by.get("user").unwrap_or_default(), "user left");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Client {
            url,
            user,
            room,
            say,
        } => run_client(url, user, room, say).await,
        Command::Disconnect { user, reconnect } => disconnect(settings, user, reconnect).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: popcable::config::Settings) -> Result<(), CableError> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let server = Server::builder(settings)
        .channel(chat_channel())
        .connection_handler(UserFromQuery)
        .build()
        .await?;

    tokio::select! {
        result = start_websocket_server(&addr, server.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            server.shutdown().await;
            // let the send loops flush the restart notices
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }
}

async fn run_client(url: String, user: String, room: String, say: Option<String>) -> Result<(), CableError> {
    let separator = if url.contains('?') { '&' } else { '?' };
    let mut consumer = Consumer::connect(format!("{url}{separator}user={user}"), MonitorConfig::default());
    let identifier = json!({ "channel": "ChatChannel", "room": room }).to_string();
    consumer.subscribe(identifier.clone());
    if let Some(text) = say {
        consumer.perform(identifier, "speak", json!({ "text": text }));
    }

    loop {
        tokio::select! {
            frame = consumer.next_frame() => match frame {
                Some(frame) => println!("{}", serde_json::to_string(&frame)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    consumer.close().await;
    Ok(())
}

async fn disconnect(settings: popcable::config::Settings, user: String, reconnect: bool) -> Result<(), CableError> {
    let pubsub = broker::from_settings(&settings.pubsub, WorkerPool::new(1)).await?;
    let identity = IdentifiedBy::new().with("user", user);
    let identifier = identity
        .connection_identifier()
        .ok_or_else(|| CableError::InvalidIdentifier(String::new()))?;
    internal_channel::publish_disconnect(pubsub.as_ref(), &identifier, reconnect)?;
    info!(identifier = %identifier, reconnect, "disconnect published");

    // network adapters publish in the background
    tokio::time::sleep(Duration::from_millis(200)).await;
    pubsub.shutdown();
    Ok(())
}
