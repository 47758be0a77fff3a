//! End-to-end session/stream scenarios over in-memory transports.
//!
//! Two clients connect to one relay; dials, accepts, relayed I/O, rejection
//! paths and cascading close are exercised against the public API. No
//! wall-clock sleeps: everything synchronizes on awaited I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::duplex;
use tokio_util::sync::CancellationToken;

use weft_crypto::{Keypair, PublicKey};
use weft_proto::Addr;
use weft_session::{
    listen, ClientSession, Porter, ServerSession, ServerSessionHandle, SessionError,
    SessionLookup, Stream,
};

#[derive(Default)]
struct Registry {
    sessions: Mutex<HashMap<PublicKey, ServerSessionHandle>>,
}

impl SessionLookup for Registry {
    fn session(&self, pk: &PublicKey) -> Option<ServerSessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(pk)
            .cloned()
    }
}

struct Relay {
    keypair: Keypair,
    registry: Arc<Registry>,
}

impl Relay {
    fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
            registry: Arc::new(Registry::default()),
        }
    }

    fn public(&self) -> PublicKey {
        self.keypair.public()
    }

    /// Connects a fresh client to the relay over an in-memory pipe and
    /// starts both accept loops.
    async fn client(&self) -> (ClientSession, Porter) {
        let (conn_c, conn_s) = duplex(64 * 1024);
        let porter = Porter::new();
        let keypair = Keypair::generate();

        let respond = ServerSession::respond(
            conn_s,
            self.keypair.clone(),
            self.registry.clone() as Arc<dyn SessionLookup>,
        );
        let connect = ClientSession::connect(conn_c, keypair, self.public(), porter.clone());
        let (server_session, client_session) = tokio::join!(respond, connect);
        let mut server_session = server_session.unwrap();
        let client_session = client_session.unwrap();

        self.registry
            .sessions
            .lock()
            .unwrap()
            .insert(server_session.peer_pk(), server_session.handle());
        tokio::spawn(async move { server_session.serve().await });

        let accept_loop = client_session.clone();
        tokio::spawn(async move { accept_loop.serve().await });

        (client_session, porter)
    }
}

async fn read_exactly(stream: &mut Stream, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let got = stream.read(&mut out[filled..]).await.unwrap();
        assert_ne!(got, 0, "unexpected EOF after {filled} bytes");
        filled += got;
    }
    out
}

#[tokio::test]
async fn happy_dial_ping_pong() {
    let relay = Relay::new();
    let (a, porter_a) = relay.client().await;
    let (b, porter_b) = relay.client().await;

    let mut listener = listen(&porter_b, 5000).unwrap();

    let cancel = CancellationToken::new();
    let dial = a.dial_stream(Addr::new(b.local_pk(), 5000), &cancel);
    let accept = listener.accept();
    let (dialed, accepted) = tokio::join!(dial, accept);
    let mut a_stream = dialed.unwrap();
    let mut b_stream = accepted.unwrap();

    // Both ends agree on the address pair.
    assert_eq!(a_stream.local_addr(), b_stream.remote_addr());
    assert_eq!(a_stream.remote_addr(), b_stream.local_addr());
    assert_eq!(a_stream.remote_addr(), Addr::new(b.local_pk(), 5000));
    assert!(a_stream.local_addr().port >= 49152);

    // Challenge round-trip proves both sides hold the same stream key.
    a_stream.write_all(b"ping").await.unwrap();
    assert_eq!(read_exactly(&mut b_stream, 4).await, b"ping");
    b_stream.write_all(b"pong").await.unwrap();
    assert_eq!(read_exactly(&mut a_stream, 4).await, b"pong");

    // Closing one end surfaces EOF on the other.
    let a_port = a_stream.local_addr().port;
    a_stream.close().await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(b_stream.read(&mut buf).await.unwrap(), 0);

    // The dialer's reservation is gone after close.
    assert!(porter_a.lookup(a_port).is_none());

    b_stream.close().await.unwrap();
    listener.close().await;
    assert!(porter_b.is_empty());
}

#[tokio::test]
async fn dial_to_port_without_listener_is_rejected() {
    let relay = Relay::new();
    let (a, porter_a) = relay.client().await;
    let (b, _porter_b) = relay.client().await;

    let err = a
        .dial_stream(Addr::new(b.local_pk(), 9999), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NoListener));
    // The ephemeral reservation made for the dial is released on failure.
    assert!(porter_a.is_empty());
}

#[tokio::test]
async fn dial_to_unknown_peer_fails() {
    let relay = Relay::new();
    let (a, porter_a) = relay.client().await;

    let stranger = Keypair::generate().public();
    let err = a
        .dial_stream(Addr::new(stranger, 5000), &CancellationToken::new())
        .await
        .unwrap_err();
    // The relay drops the substream without a response.
    assert!(matches!(
        err,
        SessionError::SubStreamClosed | SessionError::ShortRead | SessionError::Io(_)
    ));
    assert!(porter_a.is_empty());
}

#[tokio::test]
async fn concurrent_dials_succeed_independently() {
    let relay = Relay::new();
    let (a, _porter_a) = relay.client().await;
    let (b, porter_b) = relay.client().await;

    let mut listener_one = listen(&porter_b, 6001).unwrap();
    let mut listener_two = listen(&porter_b, 6002).unwrap();

    let cancel = CancellationToken::new();
    let dial_one = a.dial_stream(Addr::new(b.local_pk(), 6001), &cancel);
    let dial_two = a.dial_stream(Addr::new(b.local_pk(), 6002), &cancel);
    let accept_one = listener_one.accept();
    let accept_two = listener_two.accept();

    let (d1, d2, acc1, acc2) = tokio::join!(dial_one, dial_two, accept_one, accept_two);
    let (mut d1, mut d2) = (d1.unwrap(), d2.unwrap());
    let (mut acc1, mut acc2) = (acc1.unwrap(), acc2.unwrap());

    assert_ne!(d1.local_addr().port, d2.local_addr().port);

    // No cross-talk between the two streams.
    d1.write_all(b"first").await.unwrap();
    d2.write_all(b"second").await.unwrap();
    assert_eq!(read_exactly(&mut acc1, 5).await, b"first");
    assert_eq!(read_exactly(&mut acc2, 6).await, b"second");

    acc2.write_all(b"reply-two").await.unwrap();
    acc1.write_all(b"reply-one").await.unwrap();
    assert_eq!(read_exactly(&mut d1, 9).await, b"reply-one");
    assert_eq!(read_exactly(&mut d2, 9).await, b"reply-two");
}

#[tokio::test]
async fn large_transfer_round_trips_through_the_relay() {
    let relay = Relay::new();
    let (a, _porter_a) = relay.client().await;
    let (b, porter_b) = relay.client().await;

    let mut listener = listen(&porter_b, 7000).unwrap();
    let cancel = CancellationToken::new();
    let dial = a.dial_stream(Addr::new(b.local_pk(), 7000), &cancel);
    let (dialed, accepted) = tokio::join!(dial, listener.accept());
    let mut a_stream = dialed.unwrap();
    let mut b_stream = accepted.unwrap();

    // Spans several write chunks, so framing and reassembly are exercised.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        a_stream.write_all(&payload).await.unwrap();
        a_stream.close().await.unwrap();
    });

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = b_stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    writer.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn stream_close_is_idempotent_and_releases_port_once() {
    let relay = Relay::new();
    let (a, porter_a) = relay.client().await;
    let (b, porter_b) = relay.client().await;

    let mut listener = listen(&porter_b, 5000).unwrap();
    let cancel = CancellationToken::new();
    let dial = a.dial_stream(Addr::new(b.local_pk(), 5000), &cancel);
    let (dialed, accepted) = tokio::join!(dial, listener.accept());
    let mut a_stream = dialed.unwrap();
    let port = a_stream.local_addr().port;

    a_stream.close().await.unwrap();
    assert!(porter_a.lookup(port).is_none());

    // A port reused by someone else must survive repeated closes.
    let _other = listen(&porter_a, port).unwrap();
    a_stream.close().await.unwrap();
    a_stream.close().await.unwrap();
    assert!(porter_a.lookup(port).is_some());

    drop(accepted);
}

#[tokio::test]
async fn session_close_cascades_to_streams_and_porter() {
    let relay = Relay::new();
    let (a, porter_a) = relay.client().await;
    let (b, porter_b) = relay.client().await;

    let mut listener = listen(&porter_b, 5000).unwrap();
    let cancel = CancellationToken::new();
    let dial = a.dial_stream(Addr::new(b.local_pk(), 5000), &cancel);
    let (dialed, accepted) = tokio::join!(dial, listener.accept());
    let mut a_stream = dialed.unwrap();
    let mut b_stream = accepted.unwrap();

    a.close().await;

    // A's own streams fail terminally on the next operation.
    let mut buf = [0u8; 4];
    assert!(matches!(
        a_stream.read(&mut buf).await,
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(
        a_stream.write(b"late").await,
        Err(SessionError::SessionClosed)
    ));

    // New dials are refused.
    assert!(matches!(
        a.dial_stream(Addr::new(b.local_pk(), 5000), &CancellationToken::new())
            .await,
        Err(SessionError::SessionClosed)
    ));

    // A's porter is drained by the cascade without waiting for stream drops.
    assert!(porter_a.is_empty());

    // B's half of the relayed stream terminates: EOF or a reset, depending
    // on how far the relay teardown has progressed.
    let terminal = b_stream.read(&mut buf).await;
    assert!(matches!(terminal, Ok(0) | Err(_)));

    b_stream.close().await.unwrap();
    listener.close().await;
    assert!(porter_b.is_empty());
}

#[tokio::test]
async fn canceled_dial_cleans_up() {
    let relay = Relay::new();
    let (a, porter_a) = relay.client().await;
    let (b, _porter_b) = relay.client().await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    // With the token already canceled the dial must not start any work.
    let err = a
        .dial_stream(Addr::new(b.local_pk(), 5000), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Canceled));
    assert!(porter_a.is_empty());
}

#[tokio::test]
async fn full_listener_inbox_rejects_with_busy() {
    let relay = Relay::new();
    let (a, _porter_a) = relay.client().await;
    let (b, porter_b) = relay.client().await;

    // Nobody accepts: the inbox (capacity 64) slowly fills.
    let mut listener = listen(&porter_b, 5000).unwrap();
    let cancel = CancellationToken::new();
    let dst = Addr::new(b.local_pk(), 5000);

    let mut streams = Vec::new();
    for _ in 0..64 {
        streams.push(a.dial_stream(dst, &cancel).await.unwrap());
    }
    let err = a.dial_stream(dst, &cancel).await.unwrap_err();
    assert!(matches!(err, SessionError::BusyListener));

    // Accepting one frees a slot.
    let mut accepted = listener.accept().await.unwrap();
    let mut extra = a.dial_stream(dst, &cancel).await.unwrap();
    extra.write_all(b"ok").await.unwrap();

    accepted.close().await.unwrap();
    for mut s in streams {
        s.close().await.unwrap();
    }
}

#[tokio::test]
async fn closed_listener_unblocks_accept() {
    let relay = Relay::new();
    let (_a, _porter_a) = relay.client().await;
    let (_b, porter_b) = relay.client().await;

    let mut listener = listen(&porter_b, 5000).unwrap();
    listener.close().await;
    assert!(matches!(
        listener.accept().await,
        Err(SessionError::ListenerClosed)
    ));
    assert!(porter_b.is_empty());
}
