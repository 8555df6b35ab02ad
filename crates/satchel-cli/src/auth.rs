//! Supabase sessions persisted in the OS keychain.

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(not(test))]
use keyring::Entry;

use satchel_core::auth::{AuthError, AuthResult, AuthSession, SessionPersistence, SupabaseAuthClient};
use satchel_core::config::BackendConfig;

#[cfg(not(test))]
const KEYRING_SERVICE_NAME: &str = "satchel-cli";

/// One keychain entry per Supabase project.
#[derive(Clone)]
pub struct SessionStore {
    username: String,
}

impl SessionStore {
    pub fn for_backend(config: &BackendConfig) -> Self {
        Self {
            username: format!("supabase_session:{}", config.supabase_url),
        }
    }

    #[cfg(test)]
    fn test_store() -> &'static Mutex<HashMap<String, String>> {
        static STORE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    #[cfg(not(test))]
    fn entry(&self) -> AuthResult<Entry> {
        Entry::new(KEYRING_SERVICE_NAME, &self.username)
            .map_err(|error| AuthError::SecureStorage(error.to_string()))
    }
}

impl SessionPersistence for SessionStore {
    #[cfg(not(test))]
    fn load_session(&self) -> AuthResult<Option<AuthSession>> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(AuthError::SecureStorage(error.to_string())),
        }
    }

    #[cfg(test)]
    fn load_session(&self) -> AuthResult<Option<AuthSession>> {
        let guard = Self::test_store()
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        guard
            .get(&self.username)
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .map_err(AuthError::from)
    }

    #[cfg(not(test))]
    fn save_session(&self, session: &AuthSession) -> AuthResult<()> {
        let raw = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&raw)
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        Ok(())
    }

    #[cfg(test)]
    fn save_session(&self, session: &AuthSession) -> AuthResult<()> {
        let raw = serde_json::to_string(session)?;
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        guard.insert(self.username.clone(), raw);
        Ok(())
    }

    #[cfg(not(test))]
    fn clear_session(&self) -> AuthResult<()> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(AuthError::SecureStorage(error.to_string())),
        }
    }

    #[cfg(test)]
    fn clear_session(&self) -> AuthResult<()> {
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        guard.remove(&self.username);
        Ok(())
    }
}

pub type CliAuthClient = SupabaseAuthClient<SessionStore>;

pub fn auth_client(config: &BackendConfig) -> AuthResult<CliAuthClient> {
    SupabaseAuthClient::new(
        &config.supabase_url,
        config.supabase_anon_key.clone(),
        SessionStore::for_backend(config),
    )
}

#[cfg(test)]
mod tests {
    use satchel_core::auth::AuthUser;

    use super::*;

    fn config(url: &str) -> BackendConfig {
        BackendConfig::resolve(Some(url.to_string()), Some("anon".to_string()), None)
            .unwrap()
            .unwrap()
    }

    fn session() -> AuthSession {
        AuthSession {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: 4_102_444_800,
            user: AuthUser {
                id: "user".to_string(),
                email: Some("student@example.com".to_string()),
            },
        }
    }

    #[test]
    fn sessions_are_scoped_per_project() {
        let first = SessionStore::for_backend(&config("https://first.supabase.co"));
        let second = SessionStore::for_backend(&config("https://second.supabase.co"));

        first.save_session(&session()).unwrap();

        assert_eq!(first.load_session().unwrap(), Some(session()));
        assert_eq!(second.load_session().unwrap(), None);

        first.clear_session().unwrap();
        assert_eq!(first.load_session().unwrap(), None);
    }

    #[test]
    fn auth_client_uses_project_auth_url() {
        let client = auth_client(&config("https://demo.supabase.co")).unwrap();
        assert_eq!(client.auth_url(), "https://demo.supabase.co/auth/v1");
    }
}
