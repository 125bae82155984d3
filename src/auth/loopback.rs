use crate::error::{BackupError, Result};
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

type CallbackSender = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// One-shot HTTP listener on 127.0.0.1 that receives the authorization
/// redirect.
pub struct LoopbackReceiver {
    listener: TcpListener,
    addr: SocketAddr,
}

async fn callback_handler(
    State(sender): State<CallbackSender>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let ok = params.code.is_some();
    if let Some(tx) = sender.lock().ok().and_then(|mut s| s.take()) {
        let _ = tx.send(params);
    }
    if ok {
        Html("<html><body>Authorization received. You can close this window.</body></html>")
    } else {
        Html("<html><body>Authorization failed. Check the backup tool's output.</body></html>")
    }
}

impl LoopbackReceiver {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let addr = listener.local_addr()?;
        debug!("Loopback receiver listening on {}", addr);
        Ok(Self { listener, addr })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}:{}/", self.addr.ip(), self.addr.port())
    }

    /// Waits for the redirect and returns the authorization code after
    /// checking `expected_state`.
    pub async fn wait_for_code(self, expected_state: &str, timeout: Duration) -> Result<String> {
        let (tx, rx) = oneshot::channel::<CallbackParams>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let sender: CallbackSender = Arc::new(Mutex::new(Some(tx)));

        let app = Router::new()
            .route("/", get(callback_handler))
            .with_state(sender);

        let server = tokio::spawn(async move {
            let serve = axum::serve(self.listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("Loopback receiver error: {}", e);
            }
        });

        let received = tokio::time::timeout(timeout, rx).await;
        let _ = shutdown_tx.send(());
        let _ = server.await;

        let params = match received {
            Ok(Ok(params)) => params,
            Ok(Err(_)) => {
                return Err(BackupError::AuthenticationMissing(
                    "authorization receiver stopped before a redirect arrived".to_string(),
                ))
            }
            Err(_) => {
                return Err(BackupError::AuthenticationMissing(format!(
                    "no authorization redirect within {}s",
                    timeout.as_secs()
                )))
            }
        };

        if let Some(err) = params.error {
            return Err(BackupError::AuthenticationMissing(format!(
                "authorization was denied: {}",
                err
            )));
        }
        if params.state.as_deref() != Some(expected_state) {
            return Err(BackupError::AuthenticationMissing(
                "authorization redirect carried an unexpected state parameter".to_string(),
            ));
        }
        let code = params.code.ok_or_else(|| {
            BackupError::AuthenticationMissing("authorization redirect had no code".to_string())
        })?;
        info!("Authorization code received");
        Ok(code)
    }
}
