use std::error::Error;
use std::sync::Arc;

use log::info;
use scribe_collab::auth::{AccountStore, AuthConfig, Credentials};
use scribe_collab::config::{env_var, parse_pairs};
use scribe_collab::directory::DocumentDirectory;
use scribe_collab::server::{ServerConfig, SyncServer};

/// Register `SCRIBE_USERS` (`name:password,...`) and create
/// `SCRIBE_DOCUMENTS` (`owner:title,...`).
async fn bootstrap(
    accounts: &AccountStore,
    directory: &DocumentDirectory,
) -> Result<(), Box<dyn Error>> {
    if let Some(raw) = env_var::<String>("SCRIBE_USERS")? {
        for (username, password) in parse_pairs("SCRIBE_USERS", &raw)? {
            accounts
                .register(&Credentials::new(username.as_str(), password))
                .await?;
            info!("Registered user {username}");
        }
    }

    if let Some(raw) = env_var::<String>("SCRIBE_DOCUMENTS")? {
        for (owner, title) in parse_pairs("SCRIBE_DOCUMENTS", &raw)? {
            let Some(owner_id) = accounts.user_id(&owner).await else {
                return Err(format!("SCRIBE_DOCUMENTS: unknown owner {owner:?}").into());
            };
            let info = directory.create(owner_id, title).await;
            info!("Document {:?} owned by {owner}: {}", info.title, info.id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let accounts = Arc::new(AccountStore::new(AuthConfig::from_env()?));
    let directory = Arc::new(DocumentDirectory::new());
    bootstrap(&accounts, &directory).await?;

    info!("Starting Scribe sync server on {}...", config.bind_addr);
    let server = Arc::new(SyncServer::new(config, accounts, directory).await?);

    tokio::select! {
        result = server.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            let stats = server.stats().await;
            info!(
                "Served {} connections, {} messages, {} rooms loaded",
                stats.total_connections, stats.total_messages, stats.active_rooms
            );
        }
    }
    Ok(())
}
