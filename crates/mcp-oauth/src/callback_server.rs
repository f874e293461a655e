use crate::types::CallbackParams;
use crate::{OAuthError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warp::Filter;

pub const CALLBACK_PATH: &str = "/oauth/callback";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const CALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Complete</title>
    <style>
        body { font-family: Arial, sans-serif; text-align: center; margin-top: 50px; }
        .info { color: #6c757d; }
    </style>
</head>
<body>
    <h2>Authorization complete</h2>
    <p class="info">You can close this window and return to your terminal.</p>
</body>
</html>
"#;

type ParamsSlot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

struct Listener {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    fn signal(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Local listener receiving the OAuth redirect
///
/// Serves `GET /oauth/callback` on the loopback interface, 127.0.0.1 and,
/// where available, ::1 on the same port, so that `localhost` reaches it
/// whichever family the browser resolves first. The first request's query
/// parameters are handed to [`CallbackServer::wait`]; later requests still get
/// the confirmation page but deliver nothing.
pub struct CallbackServer {
    addr: SocketAddr,
    receiver: Option<oneshot::Receiver<CallbackParams>>,
    listeners: Vec<Listener>,
}

impl CallbackServer {
    /// Bind the listener on `port` (0 picks a free port) and start serving.
    pub fn bind(port: u16) -> Result<Self> {
        let (params_tx, params_rx) = oneshot::channel();
        let slot: ParamsSlot = Arc::new(Mutex::new(Some(params_tx)));

        let route = warp::get()
            .and(warp::path!("oauth" / "callback"))
            .and(warp::query::<Vec<(String, String)>>())
            .map(move |pairs: Vec<(String, String)>| {
                deliver(&slot, first_values(pairs));
                warp::reply::with_header(
                    warp::reply::html(CALLBACK_PAGE),
                    "connection",
                    "close",
                )
            });

        let listen = |addr: SocketAddr| -> std::result::Result<Listener, warp::Error> {
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let (addr, server) = warp::serve(route.clone())
                .try_bind_with_graceful_shutdown(addr, async move {
                    let _ = shutdown_rx.await;
                })?;
            Ok(Listener {
                addr,
                shutdown: Some(shutdown_tx),
                task: Some(tokio::spawn(server)),
            })
        };

        let v4 = listen(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).map_err(|e| {
            OAuthError::CallbackServer(format!("Failed to bind to port {}: {}", port, e))
        })?;
        let addr = v4.addr;
        let mut listeners = vec![v4];

        match listen(SocketAddr::from((Ipv6Addr::LOCALHOST, addr.port()))) {
            Ok(v6) => listeners.push(v6),
            Err(e) => debug!("IPv6 loopback unavailable for callback server: {}", e),
        }

        info!("OAuth callback server listening on localhost:{}", addr.port());

        Ok(Self {
            addr,
            receiver: Some(params_rx),
            listeners,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the callback. `None` waits until the process is interrupted.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<CallbackParams> {
        let receiver = self.receiver.as_mut().ok_or_else(|| {
            OAuthError::CallbackServer("Callback already received".to_string())
        })?;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("OAuth authorization timed out after {:?}", limit);
                    return Err(OAuthError::AuthTimeout);
                }
            },
            None => receiver.await,
        };
        self.receiver = None;

        received.map_err(|_| OAuthError::CallbackServer("Server channel closed".to_string()))
    }

    /// Stop accepting connections and wait briefly for the server tasks to finish.
    pub async fn shutdown(mut self) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            listener.signal();
        }
        for listener in &mut listeners {
            if let Some(mut task) = listener.task.take() {
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                    warn!("Callback server on {} did not stop in time, aborting", listener.addr);
                    task.abort();
                }
            }
        }
        debug!("Callback server on port {} stopped", self.addr.port());
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        for listener in &mut self.listeners {
            listener.signal();
            if let Some(task) = listener.task.take() {
                task.abort();
            }
        }
    }
}

fn first_values(pairs: Vec<(String, String)>) -> CallbackParams {
    let mut params = CallbackParams::new();
    for (key, value) in pairs {
        params.entry(key).or_insert(value);
    }
    params
}

fn deliver(slot: &ParamsSlot, params: CallbackParams) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match sender {
        Some(sender) => {
            info!("Received OAuth callback");
            if sender.send(params).is_err() {
                debug!("Callback receiver already gone");
            }
        }
        None => debug!("Ignoring repeated OAuth callback"),
    }
}

#[cfg(test)]
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}
