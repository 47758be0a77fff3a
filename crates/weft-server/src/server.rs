//! Accept loop and per-connection session handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_crypto::{Keypair, PublicKey};
use weft_session::{ServerSession, SessionLookup};

use crate::{ServerConfig, ServerError, SessionRegistry};

/// A bound relay server, ready to serve client sessions.
pub struct Server {
    keypair: Keypair,
    registry: Arc<SessionRegistry>,
    listener: TcpListener,
    relay_idle_timeout: Duration,
}

impl Server {
    /// Binds the listen socket. The identity comes from the config (or is
    /// generated fresh when unset).
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        crate::validate_config(config)?;
        let keypair = config.keypair()?;
        let listener = TcpListener::bind(&config.listen).await?;
        Ok(Self {
            keypair,
            registry: Arc::new(SessionRegistry::new()),
            listener,
            relay_idle_timeout: Duration::from_secs(config.relay_idle_timeout_secs),
        })
    }

    /// The bound address, useful with a `:0` listen port.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The server's identity, which clients must dial by.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// The session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs the accept loop until `shutdown` fires. Each connection gets
    /// its own task: session handshake, registration, then the session's
    /// substream accept loop.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!(address = %self.local_addr()?, identity = %self.public_key(), "listening");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }

                result = self.listener.accept() => {
                    let (tcp, peer_addr) = result?;
                    let keypair = self.keypair.clone();
                    let registry = Arc::clone(&self.registry);
                    let idle_timeout = self.relay_idle_timeout;
                    tokio::spawn(async move {
                        handle_conn(tcp, peer_addr, keypair, registry, idle_timeout).await;
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_conn(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    keypair: Keypair,
    registry: Arc<SessionRegistry>,
    relay_idle_timeout: Duration,
) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(%peer_addr, "set_nodelay failed: {e}");
    }
    let lookup: Arc<dyn SessionLookup> = registry.clone();
    let mut session = match ServerSession::respond(tcp, keypair, lookup).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer_addr, "session handshake failed: {e}");
            return;
        }
    };
    session.set_relay_idle_timeout(relay_idle_timeout);

    let peer = session.peer_pk();
    let handle = session.handle();
    let id = handle.id();
    if let Some(previous) = registry.insert(handle) {
        info!(%peer, "new session replaces an existing one");
        previous.close();
    }
    info!(%peer, %peer_addr, "session up");

    session.serve().await;

    registry.remove_if_current(&peer, id);
    info!(%peer, %peer_addr, "session down");
}
