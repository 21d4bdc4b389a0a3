use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Duration;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use keyvault_core::clock;
use keyvault_core::keys::StoreKind;
use keyvault_core::token::TokenService;
use keyvault_core::{CoreConfig, CoreError, MasterKeyManager};

#[derive(Parser)]
#[command(name = "keyvault")]
#[command(about = "Local master key custody, per-store keys and bearer tokens")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the master secret (prompts for a passphrase)
    Setup,
    /// Start or resume a session
    Unlock,
    /// End the session
    Lock,
    /// Show initialization and session state
    Status,
    /// Derive the key for a local store
    Derive {
        /// Store kind, e.g. `libsql` or `kv`
        kind: String,
        /// Path of the store
        path: PathBuf,
        /// Print the key itself instead of its fingerprint
        #[arg(long)]
        reveal: bool,
    },
    /// Bearer token operations
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a token for a subject
    Issue {
        subject: String,
        /// Lifetime in seconds (defaults to KEYVAULT_TOKEN_TTL_SECS)
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Verify a token and print its claims
    Verify { token: String },
    /// Revoke a token by id
    Revoke { token_id: String },
    /// Drop revocations of tokens that have expired anyway
    Prune,
}

/// Passphrase from `KEYVAULT_PASSPHRASE`, else one line of stdin.
fn read_passphrase() -> anyhow::Result<Zeroizing<String>> {
    if let Ok(passphrase) = std::env::var("KEYVAULT_PASSPHRASE") {
        return Ok(Zeroizing::new(passphrase));
    }
    eprint!("Passphrase: ");
    std::io::stderr().flush().ok();
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading passphrase")?;
    let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if trimmed.is_empty() {
        bail!("no passphrase given");
    }
    Ok(trimmed)
}

/// Resume the session if there is one, otherwise ask for the passphrase.
async fn unlock(manager: &Arc<MasterKeyManager>) -> anyhow::Result<()> {
    match manager.unlock_async(None).await {
        Ok(_) => Ok(()),
        Err(CoreError::InteractionRequired) => {
            let passphrase = read_passphrase()?;
            manager
                .unlock_async(Some(passphrase.to_string()))
                .await
                .map_err(|e| anyhow::anyhow!(e.public_message()))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn token_service(config: &CoreConfig, manager: &MasterKeyManager) -> anyhow::Result<TokenService> {
    TokenService::from_manager(manager, Arc::new(config.revocation_store()), clock::system())
        .context("token service needs an unlocked session (run `keyvault unlock`)")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyvault_core=info,keyvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = CoreConfig::from_env()?;
    let manager = Arc::new(config.key_manager(clock::system()));

    match cli.command {
        Commands::Setup => {
            let passphrase = read_passphrase()?;
            let master = manager.setup(&passphrase)?;
            info!(data_dir = %config.data_dir.display(), "setup complete");
            println!("initialized {}", master.fingerprint());
        }
        Commands::Unlock => {
            unlock(&manager).await?;
            let info = manager.session_info()?;
            println!(
                "unlocked for {}s",
                info.remaining_ttl_secs.unwrap_or_default()
            );
        }
        Commands::Lock => {
            manager.lock()?;
            println!("locked");
        }
        Commands::Status => {
            let status = serde_json::json!({
                "initialized": manager.is_initialized()?,
                "service": manager.service(),
                "session": manager.session_info()?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Derive { kind, path, reveal } => {
            let kind = StoreKind::parse(&kind)?;
            let key = manager.derive_for_store(&kind, &path)?;
            if reveal {
                println!("{}", hex::encode(key.as_bytes()));
            } else {
                println!(
                    "{} {}",
                    key.purpose(),
                    keyvault_core::crypto::hash::fingerprint(key.as_bytes())
                );
            }
        }
        Commands::Token { command } => {
            let tokens = token_service(&config, &manager)?;
            match command {
                TokenCommands::Issue { subject, ttl } => {
                    let ttl = ttl.map(Duration::seconds).unwrap_or(config.token_ttl);
                    let token = tokens.issue(&subject, ttl)?;
                    eprintln!("token id {} expires {}", token.token_id, token.expires_at);
                    println!("{}", token.encoded);
                }
                TokenCommands::Verify { token } => {
                    let verified = tokens
                        .verify(&token)
                        .map_err(|e| anyhow::anyhow!(e.public_message()))?;
                    println!("{}", serde_json::to_string_pretty(&verified)?);
                }
                TokenCommands::Revoke { token_id } => {
                    tokens.revoke(&token_id)?;
                    println!("revoked {token_id}");
                }
                TokenCommands::Prune => {
                    let removed = tokens.prune()?;
                    println!("pruned {removed}");
                }
            }
        }
    }

    Ok(())
}
