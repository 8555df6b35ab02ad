use std::path::Path;

use satchel_core::sync::LocalStore;

use crate::cli::ApiKeyCommands;
use crate::commands::common::{mask_secret, open_database};
use crate::error::CliError;

pub async fn run_api_key(command: ApiKeyCommands, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    match command {
        ApiKeyCommands::Set { key } => {
            let key = key.trim();
            if key.is_empty() {
                return Err(CliError::EmptyApiKey);
            }
            db.save_api_key(Some(key)).await?;
            println!("API key stored on this device ({})", mask_secret(key));
        }
        ApiKeyCommands::Show => match db.get_api_key().await? {
            Some(key) => println!("{}", mask_secret(&key)),
            None => println!("No API key stored."),
        },
        ApiKeyCommands::Clear => {
            db.save_api_key(None).await?;
            println!("API key removed");
        }
    }
    Ok(())
}
