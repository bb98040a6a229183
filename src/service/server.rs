//! Vote listener: accept loop, admission control and shutdown.

use crate::config::VotifierConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::VoteSink;
use crate::protocol::handshake::ChallengeIssuer;
use crate::service::connection::{handle_connection, ListenerContext};
use crate::utils::keys::KeyMaterial;
use crate::utils::metrics::Metrics;
use crate::utils::rate_limit::RateLimitState;
use crate::utils::timeout::with_timeout_error;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Pause after a failed `accept` (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A running vote listener.
///
/// Owns its key material, rate-limit table, challenge ledger and metrics;
/// nothing is process-global, so several listeners can run side by side.
pub struct VoteListener {
    local_addr: SocketAddr,
    ctx: Arc<ListenerContext>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VoteListener {
    /// Bind `bind_addr` and start accepting.
    ///
    /// `config.server.address` is ignored here; `bind_addr` may be any
    /// `host:port` the resolver understands. Fails if the server limits or
    /// rate-limit settings are invalid, or if the key material leaves no
    /// protocol enabled.
    #[instrument(skip(keys, config, sink))]
    pub async fn start(
        bind_addr: &str,
        keys: Arc<KeyMaterial>,
        config: &VotifierConfig,
        sink: Arc<dyn VoteSink>,
    ) -> Result<Self> {
        let mut problems = config.server.validate_limits();
        problems.extend(config.rate_limit.validate());
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }

        let v1 = !config.server.disable_v1 && keys.supports_v1();
        let v2 = keys.supports_v2();
        if !v1 && !v2 {
            return Err(ProtocolError::ConfigError(
                "No protocol enabled: configure an RSA key pair or at least one token".into(),
            ));
        }

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(ListenerContext {
            keys,
            config: config.server.clone(),
            rate_limits: Mutex::new(RateLimitState::new(config.rate_limit.clone())),
            challenges: ChallengeIssuer::new(),
            metrics: Arc::new(Metrics::new()),
            sink,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, ctx.clone(), shutdown_rx));

        info!(address = %local_addr, v1, v2, "Vote listener started");

        Ok(Self {
            local_addr,
            ctx,
            shutdown_tx,
            accept_task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Load or generate key material from `config.keys`, then start on
    /// `config.server.address`.
    ///
    /// A generated default token is written back into `config.keys.tokens`.
    /// The listen address and key settings are checked before any key is
    /// read or generated.
    pub async fn from_config(
        config: &mut VotifierConfig,
        sink: Arc<dyn VoteSink>,
    ) -> Result<Self> {
        let mut problems = config.server.validate_address();
        problems.extend(config.keys.validate());
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }

        let load_rsa = !config.server.disable_v1;
        let mut keys_config = config.keys.clone();
        // Key generation is CPU-bound; keep it off the runtime threads.
        let (keys, keys_config) = tokio::task::spawn_blocking(move || {
            KeyMaterial::load_or_generate(&mut keys_config, load_rsa).map(|k| (k, keys_config))
        })
        .await
        .map_err(|e| ProtocolError::Custom(e.to_string()))??;
        config.keys = keys_config;

        let address = config.server.address.clone();
        Self::start(&address, Arc::new(keys), config, sink).await
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    pub async fn is_running(&self) -> bool {
        match self.accept_task.lock().await.as_ref() {
            Some(task) => !task.is_finished(),
            None => false,
        }
    }

    /// Stop accepting, let in-flight handlers finish within the configured
    /// grace period, abort the rest and release the socket. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let task = self.accept_task.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };

        task.await
            .map_err(|e| ProtocolError::Custom(format!("Accept loop failed: {e}")))?;

        self.ctx.metrics.log_metrics();
        info!(address = %self.local_addr, "Vote listener stopped");
        Ok(())
    }
}

impl Drop for VoteListener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if handlers.len() >= ctx.config.max_connections {
                        ctx.metrics.connection_refused();
                        debug!(
                            %peer,
                            in_flight = handlers.len(),
                            "Connection refused: handler cap reached"
                        );
                        continue;
                    }
                    let admission = ctx.admit(peer.ip());
                    if !admission.is_allowed() {
                        ctx.metrics.connection_refused();
                        debug!(%peer, ?admission, "Connection refused by rate limit");
                        continue;
                    }
                    handlers.spawn(handle_connection(stream, peer, ctx.clone()));
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    info!(in_flight = handlers.len(), "Listener closed; draining handlers");

    let drain = async {
        while handlers.join_next().await.is_some() {}
        Ok(())
    };
    if with_timeout_error(drain, ctx.config.shutdown_timeout)
        .await
        .is_err()
    {
        warn!(
            remaining = handlers.len(),
            "Shutdown grace period elapsed; aborting handlers"
        );
        handlers.shutdown().await;
    }
}
