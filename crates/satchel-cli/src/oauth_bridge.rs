//! Loopback redirect listener for browser sign-in.

use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::Uri;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use satchel_core::auth::{AuthError, AuthResult, OAuthBridge, OAuthStart};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const CALLBACK_PATH: &str = "/callback";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const CALLBACK_PAGE: &str = "<!doctype html><html><body><p>Signed in to Satchel. You can close this window.</p></body></html>";

/// Listens on `127.0.0.1` for the provider redirect.
pub struct LoopbackBridge {
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    timeout: Duration,
    open_browser: bool,
}

impl Default for LoopbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBridge {
    pub fn new() -> Self {
        Self {
            listener: tokio::sync::Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
            open_browser: true,
        }
    }

    /// Print the URL instead of launching a browser.
    #[must_use]
    pub const fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }
}

#[async_trait]
impl OAuthBridge for LoopbackBridge {
    async fn begin_oauth(&self) -> AuthResult<OAuthStart> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|error| AuthError::OAuth(format!("failed to bind loopback listener: {error}")))?;
        let port = listener
            .local_addr()
            .map_err(|error| AuthError::OAuth(error.to_string()))?
            .port();
        *self.listener.lock().await = Some(listener);

        Ok(OAuthStart {
            redirect_to: format!("http://127.0.0.1:{port}{CALLBACK_PATH}"),
        })
    }

    async fn open_external(&self, url: &str) -> AuthResult<()> {
        println!("Open this URL to continue signing in:\n{url}");
        if self.open_browser {
            if let Err(error) = launch_browser(url) {
                tracing::warn!(%error, "Failed to launch browser");
            }
        }
        Ok(())
    }

    async fn await_oauth_callback(&self) -> AuthResult<String> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| AuthError::OAuth("OAuth flow was not started".to_string()))?;

        serve_callback(listener, self.timeout).await
    }
}

#[derive(Clone)]
struct CallbackState {
    port: u16,
    redirect: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

fn callback_router(state: CallbackState) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(receive_callback))
        .with_state(state)
}

async fn receive_callback(State(state): State<CallbackState>, uri: Uri) -> Html<&'static str> {
    let url = format!("http://127.0.0.1:{}{uri}", state.port);
    let sender = state
        .redirect
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(url);
    }
    Html(CALLBACK_PAGE)
}

/// Serve the loopback router until the first `/callback` hit or `timeout`.
///
/// Every connection is handled on its own task, so idle sockets a browser
/// opens speculatively cannot hold up the redirect.
async fn serve_callback(listener: TcpListener, timeout: Duration) -> AuthResult<String> {
    let port = listener
        .local_addr()
        .map_err(|error| AuthError::OAuth(error.to_string()))?
        .port();
    let (redirect_tx, redirect_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let router = callback_router(CallbackState {
        port,
        redirect: Arc::new(Mutex::new(Some(redirect_tx))),
    });

    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let received = tokio::time::timeout(timeout, redirect_rx).await;

    let _ = stop_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
        Ok(Ok(Err(error))) => tracing::debug!(%error, "Loopback server ended with an error"),
        Ok(_) => {}
        Err(_) => server.abort(),
    }

    match received {
        Ok(Ok(url)) => Ok(url),
        Ok(Err(_)) => Err(AuthError::OAuth(
            "loopback server stopped before the browser redirect".to_string(),
        )),
        Err(_) => Err(AuthError::OAuth(
            "timed out waiting for the browser redirect".to_string(),
        )),
    }
}

fn launch_browser(url: &str) -> std::io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else {
        Command::new("xdg-open")
    };
    command.arg(url).spawn().map(|_| ())
}

#[cfg(test)]
mod tests {
    use satchel_core::auth::parse_oauth_callback;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    fn loopback_address(start: &OAuthStart) -> String {
        start
            .redirect_to
            .trim_start_matches("http://")
            .trim_end_matches(CALLBACK_PATH)
            .to_string()
    }

    async fn send_get(address: &str, target: &str) -> String {
        let mut stream = TcpStream::connect(address).await.unwrap();
        let request =
            format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn loopback_captures_redirect() {
        let bridge = LoopbackBridge::new().without_browser();
        let address = loopback_address(&bridge.begin_oauth().await.unwrap());

        let client = tokio::spawn(async move {
            let favicon = send_get(&address, "/favicon.ico").await;
            let callback = send_get(&address, "/callback?code=abc123").await;
            (favicon, callback)
        });

        let callback = bridge.await_oauth_callback().await.unwrap();
        let (favicon, response) = client.await.unwrap();

        assert!(favicon.starts_with("HTTP/1.1 404"));
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Signed in to Satchel"));
        assert_eq!(parse_oauth_callback(&callback).unwrap(), "abc123");
    }

    #[tokio::test]
    async fn idle_connection_does_not_block_redirect() {
        let bridge = LoopbackBridge::new().without_browser();
        let address = loopback_address(&bridge.begin_oauth().await.unwrap());

        let client = tokio::spawn(async move {
            let idle = TcpStream::connect(&address).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let response = send_get(&address, "/callback?code=abc123").await;
            drop(idle);
            response
        });

        let callback = tokio::time::timeout(Duration::from_secs(10), bridge.await_oauth_callback())
            .await
            .expect("redirect was not captured")
            .unwrap();

        assert_eq!(parse_oauth_callback(&callback).unwrap(), "abc123");
        assert!(client.await.unwrap().starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn callback_without_begin_fails() {
        let bridge = LoopbackBridge::new().without_browser();
        assert!(bridge.await_oauth_callback().await.is_err());
    }

    #[tokio::test]
    async fn serve_callback_times_out_without_redirect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let error = serve_callback(listener, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("timed out"));
    }
}
