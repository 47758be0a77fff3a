//! Client endpoint for the weft overlay fabric.
//!
//! A [`Client`] owns an identity keypair and the process-wide porter, and
//! keeps one session per relay server. Listeners are bound on the shared
//! porter, so incoming streams resolve to the right listener no matter
//! which session carried them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use weft_crypto::{Keypair, PublicKey};
use weft_proto::Addr;
use weft_session::{ClientSession, Conn, Listener, Porter, SessionError, Stream};

/// A weft client: one identity, one porter, any number of server sessions.
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    keypair: Keypair,
    porter: Porter,
    sessions: Mutex<HashMap<PublicKey, ClientSession>>,
}

impl Client {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            inner: Arc::new(Inner {
                keypair,
                porter: Porter::new(),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// This client's identity.
    pub fn local_pk(&self) -> PublicKey {
        self.inner.keypair.public()
    }

    /// The porter shared by all of this client's sessions.
    pub fn porter(&self) -> &Porter {
        &self.inner.porter
    }

    /// Connects a session to the server at `addr`, authenticated against
    /// `server_pk`, and starts its accept loop. Replaces (and closes) any
    /// previous session with the same server.
    pub async fn connect_tcp(
        &self,
        addr: SocketAddr,
        server_pk: PublicKey,
    ) -> Result<ClientSession, SessionError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        debug!(%addr, server = %server_pk, "connected, starting session handshake");
        self.connect(tcp, server_pk).await
    }

    /// Brings up a session over an already-established connection.
    pub async fn connect<C>(
        &self,
        conn: C,
        server_pk: PublicKey,
    ) -> Result<ClientSession, SessionError>
    where
        C: Conn + 'static,
    {
        let session = ClientSession::connect(
            conn,
            self.inner.keypair.clone(),
            server_pk,
            self.inner.porter.clone(),
        )
        .await?;

        let accept_loop = session.clone();
        tokio::spawn(async move { accept_loop.serve().await });

        let previous = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            sessions.insert(server_pk, session.clone())
        };
        if let Some(previous) = previous {
            info!(server = %server_pk, "replacing existing session");
            previous.close().await;
        }
        Ok(session)
    }

    /// The live session with `server_pk`, if any.
    pub fn session(&self, server_pk: &PublicKey) -> Option<ClientSession> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_pk)
            .cloned()
    }

    /// Binds a listener on a specific local port.
    pub fn listen(&self, port: u16) -> Result<Listener, SessionError> {
        weft_session::listen(&self.inner.porter, port)
    }

    /// Binds a listener on a porter-chosen ephemeral port.
    pub fn listen_ephemeral(&self) -> Result<Listener, SessionError> {
        weft_session::listen_ephemeral(&self.inner.porter)
    }

    /// Dials `dst` through the session with `server_pk`.
    pub async fn dial(
        &self,
        server_pk: PublicKey,
        dst: Addr,
        cancel: &CancellationToken,
    ) -> Result<Stream, SessionError> {
        let session = self.session(&server_pk).ok_or(SessionError::NoSession)?;
        session.dial_stream(dst, cancel).await
    }

    /// Closes every session. Listeners are owned by the application and
    /// close separately.
    pub async fn close(&self) {
        let sessions: Vec<ClientSession> = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }
}
