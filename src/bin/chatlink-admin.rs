use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chatlink::{
    auth::sign_session, config::ConfigLoader, connection_manager::ConnectionManager,
    connectors::ProviderClients, crypto::{TokenCipher, generate_encryption_key}, db,
    repositories::ConnectionRepository,
};

/// Operational helpers for a chatlink deployment
#[derive(Debug, Parser)]
#[command(name = "chatlink-admin", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a fresh 256-bit ENCRYPTION_KEY
    GenerateKey,
    /// Print a session token for a user, signed with the configured secret
    SignSession { user_id: String },
    /// Refresh every active connection whose token is about to expire
    RefreshTokens,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateKey => println!("{}", generate_encryption_key()),
        Command::SignSession { user_id } => {
            let config = ConfigLoader::new().load().context("loading configuration")?;
            println!("{}", sign_session(config.session_key(), &user_id));
        }
        Command::RefreshTokens => {
            let config = ConfigLoader::new().load().context("loading configuration")?;
            let db = db::init_pool(&config)
                .await
                .context("initializing database connection pool")?;

            let manager = ConnectionManager::new(
                ConnectionRepository::new(Arc::new(db)),
                TokenCipher::new(config.encryption_key.clone()),
                ProviderClients::from_config(&config),
            );
            let refreshed = manager
                .refresh_expiring_soon()
                .await
                .context("refreshing expiring tokens")?;
            println!("Refreshed {} connection(s)", refreshed);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommands_parse() {
        let cli = Cli::try_parse_from(["chatlink-admin", "generate-key"]).unwrap();
        assert!(matches!(cli.command, Command::GenerateKey));

        let cli = Cli::try_parse_from(["chatlink-admin", "sign-session", "user-1"]).unwrap();
        assert!(matches!(cli.command, Command::SignSession { user_id } if user_id == "user-1"));

        assert!(Cli::try_parse_from(["chatlink-admin"]).is_err());
    }
}
