use satchel_core::auth::{AuthSession, SessionPersistence};
use satchel_core::config::BackendConfig;

use crate::auth::{auth_client, SessionStore};
use crate::cli::AuthCommands;
use crate::commands::common::backend_config;
use crate::error::CliError;
use crate::oauth_bridge::LoopbackBridge;

pub async fn run_auth(command: AuthCommands) -> Result<(), CliError> {
    match command {
        AuthCommands::Login {
            email,
            password,
            oauth,
            no_browser,
        } => {
            let config = require_backend()?;
            let client = auth_client(&config)?;
            let session = match (oauth, email, password) {
                (Some(provider), _, _) => {
                    let bridge = if no_browser {
                        LoopbackBridge::new().without_browser()
                    } else {
                        LoopbackBridge::new()
                    };
                    client.sign_in_with_oauth(&bridge, &provider).await?
                }
                (None, Some(email), Some(password)) => client.sign_in(&email, &password).await?,
                _ => {
                    return Err(CliError::Auth(
                        "Pass --email and --password, or --oauth <provider>".to_string(),
                    ));
                }
            };
            println!("Signed in as {}", user_label(&session));
            Ok(())
        }
        AuthCommands::Status => {
            let Some(config) = backend_config()? else {
                println!("Sync is not configured.");
                return Ok(());
            };
            match auth_client(&config)?.restore_session().await? {
                Some(session) => println!(
                    "Signed in as {} (expires_at={})",
                    user_label(&session),
                    session.expires_at
                ),
                None => println!("Not signed in."),
            }
            Ok(())
        }
        AuthCommands::Logout => {
            let config = require_backend()?;
            let client = auth_client(&config)?;
            match SessionStore::for_backend(&config).load_session()? {
                Some(session) => client.sign_out(&session.access_token).await?,
                None => SessionStore::for_backend(&config).clear_session()?,
            }
            println!("Signed out");
            Ok(())
        }
    }
}

fn require_backend() -> Result<BackendConfig, CliError> {
    backend_config()?.ok_or_else(|| {
        CliError::Config(
            "Set SATCHEL_SUPABASE_URL and SATCHEL_SUPABASE_ANON_KEY to sign in.".to_string(),
        )
    })
}

fn user_label(session: &AuthSession) -> &str {
    session.user.email.as_deref().unwrap_or("(no email)")
}
