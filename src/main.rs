use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tmi_client::{ChatConfig, ChatConnection, Message};

#[tokio::main]
async fn main() -> tmi_client::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info", env!("CARGO_PKG_NAME").replace('-', "_")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ChatConfig::load()?;
    tracing::info!(
        host = %config.host,
        channel.name = %config.channel,
        live = config.live,
        "configuration loaded"
    );

    let mut connection = ChatConnection::spawn(config, log_message)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    connection.stop().await;
    connection.join().await;

    Ok(())
}

fn log_message(message: Message) {
    match message.command_type.as_str() {
        "PRIVMSG" => tracing::info!(
            user = message.user.as_deref().unwrap_or("?"),
            channel.name = message.channel.as_deref().unwrap_or("?"),
            body = %message.body,
            "chat"
        ),
        "PING" | "PONG" => tracing::trace!(raw = %message.full_text, "keepalive"),
        _ => tracing::debug!(
            command = %message.command_type,
            raw = %message.full_text,
            "server message"
        ),
    }
}
