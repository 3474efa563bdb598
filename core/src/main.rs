/// SchoolChat headless client - logs session events as JSON lines
use schoolchat_core::{ChatClient, ChatEvent, Config, Credentials};
use std::env;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let token = env::var("CHAT_TOKEN")
        .map_err(|_| anyhow::anyhow!("CHAT_TOKEN must hold a session token"))?;
    let user_id = config
        .self_user_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--user-id or CHAT_USER_ID is required"))?;

    info!("Starting SchoolChat client");
    info!("   API: {}", config.base_url);
    info!("   Push: {}", config.push_url());

    let mut client = ChatClient::new(config);
    let session = client
        .login(Credentials::new(token, user_id))
        .await
        .map_err(|e| anyhow::anyhow!("Login failed: {}", e))?;
    let mut events = session.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(event, ChatEvent::SessionExpired) {
                        warn!("Session expired, exiting");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    client.logout().await;
    Ok(())
}
