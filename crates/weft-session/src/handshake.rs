//! Session bring-up: the XK handshake on the raw connection.
//!
//! Handshake messages are `u16` length-framed and exchanged before the
//! multiplexer is attached. Reads go through a `BufReader` that exists only
//! for the handshake: if it holds any bytes once the handshake is done, the
//! bring-up fails with `HandshakeResidue`. Nothing may smuggle bytes past
//! the handshake boundary into the multiplexer.
//!
//! The client proves its identity inside the final message: it sends its
//! Ed25519 key as the (encrypted) payload, and the server checks that the
//! Noise static it authenticated is the one derived from that key.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use weft_core::MAX_HANDSHAKE_MESSAGE;
use weft_crypto::{Keypair, PublicKey, SessionCipher, SessionHandshake, PUBLIC_KEY_LEN};

use crate::{Conn, SessionError};

/// Everything a session needs after a successful handshake.
pub(crate) struct SessionParts {
    pub(crate) cipher: Arc<SessionCipher>,
    /// Authenticated identity of the other side.
    pub(crate) remote: PublicKey,
    /// The raw connection, ready for the multiplexer.
    pub(crate) conn: Box<dyn Conn + 'static>,
}

impl fmt::Debug for SessionParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParts").finish_non_exhaustive()
    }
}

/// Client side: initiates the handshake towards a server whose identity is
/// known up front.
pub(crate) async fn initiate<C>(
    conn: C,
    local: &Keypair,
    remote: PublicKey,
) -> Result<SessionParts, SessionError>
where
    C: Conn + 'static,
{
    let mut hs =
        SessionHandshake::initiator(local, &remote).map_err(SessionError::HandshakeFailed)?;

    let (read_half, mut write_half) = tokio::io::split(conn);
    let mut reader = BufReader::new(read_half);

    let m1 = hs.write_message(&[]).map_err(SessionError::HandshakeFailed)?;
    write_message(&mut write_half, &m1).await?;

    let m2 = read_message(&mut reader).await?;
    hs.read_message(&m2).map_err(SessionError::HandshakeFailed)?;

    let m3 = hs
        .write_message(local.public().as_bytes())
        .map_err(SessionError::HandshakeFailed)?;
    write_message(&mut write_half, &m3).await?;

    if !reader.buffer().is_empty() {
        return Err(SessionError::HandshakeResidue);
    }
    let conn = reader.into_inner().unsplit(write_half);

    let (cipher, _) = hs.into_transport().map_err(SessionError::HandshakeFailed)?;
    Ok(SessionParts {
        cipher: Arc::new(cipher),
        remote,
        conn: Box::new(conn),
    })
}

/// Server side: responds to the handshake and learns the client's identity.
pub(crate) async fn respond<C>(conn: C, local: &Keypair) -> Result<SessionParts, SessionError>
where
    C: Conn + 'static,
{
    let mut hs = SessionHandshake::responder(local).map_err(SessionError::HandshakeFailed)?;

    let (read_half, mut write_half) = tokio::io::split(conn);
    let mut reader = BufReader::new(read_half);

    let m1 = read_message(&mut reader).await?;
    hs.read_message(&m1).map_err(SessionError::HandshakeFailed)?;

    let m2 = hs.write_message(&[]).map_err(SessionError::HandshakeFailed)?;
    write_message(&mut write_half, &m2).await?;

    let m3 = read_message(&mut reader).await?;
    let claimed = hs.read_message(&m3).map_err(SessionError::HandshakeFailed)?;

    if !reader.buffer().is_empty() {
        return Err(SessionError::HandshakeResidue);
    }
    let conn = reader.into_inner().unsplit(write_half);

    let claimed: [u8; PUBLIC_KEY_LEN] = claimed
        .as_slice()
        .try_into()
        .map_err(|_| SessionError::HandshakeFailed(weft_crypto::CryptoError::InvalidKey))?;
    let claimed = PublicKey::from_bytes(claimed).map_err(SessionError::HandshakeFailed)?;

    let (cipher, remote_static) = hs.into_transport().map_err(SessionError::HandshakeFailed)?;
    // The claimed identity must be the one the authenticated static derives
    // from, otherwise the payload is a lie.
    if claimed.x25519().map_err(SessionError::HandshakeFailed)? != remote_static {
        return Err(SessionError::HandshakeFailed(
            weft_crypto::CryptoError::InvalidKey,
        ));
    }

    Ok(SessionParts {
        cipher: Arc::new(cipher),
        remote: claimed,
        conn: Box::new(conn),
    })
}

async fn write_message<W>(writer: &mut W, message: &[u8]) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(message.len() <= MAX_HANDSHAKE_MESSAGE);
    let mut buf = Vec::with_capacity(2 + message.len());
    buf.extend_from_slice(&(message.len() as u16).to_be_bytes());
    buf.extend_from_slice(message);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len > MAX_HANDSHAKE_MESSAGE {
        return Err(SessionError::FrameTooLarge(len));
    }
    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn session_handshake_authenticates_client_identity() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let (conn_c, conn_s) = duplex(4096);

        let server_kp = server.clone();
        let responder = tokio::spawn(async move { respond(conn_s, &server_kp).await });

        let parts_c = initiate(conn_c, &client, server.public()).await.unwrap();
        let parts_s = responder.await.unwrap().unwrap();

        assert_eq!(parts_c.remote, server.public());
        assert_eq!(parts_s.remote, client.public());

        // Both directions of the session cipher line up.
        let sealed = parts_c.cipher.seal(b"after handshake").unwrap();
        assert_eq!(parts_s.cipher.open(&sealed).unwrap(), b"after handshake");
    }

    #[tokio::test]
    async fn junk_after_final_message_fails_with_residue() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let (conn_c, conn_s) = duplex(4096);

        let server_kp = server.clone();
        let responder = tokio::spawn(async move { respond(conn_s, &server_kp).await });

        // Hand-rolled initiator that appends junk directly after the final
        // handshake message, in the same write.
        let mut hs = SessionHandshake::initiator(&client, &server.public()).unwrap();
        let (read_half, mut write_half) = tokio::io::split(conn_c);
        let mut reader = BufReader::new(read_half);

        let m1 = hs.write_message(&[]).unwrap();
        write_message(&mut write_half, &m1).await.unwrap();
        let m2 = read_message(&mut reader).await.unwrap();
        hs.read_message(&m2).unwrap();

        let m3 = hs.write_message(client.public().as_bytes()).unwrap();
        let mut tail = Vec::new();
        tail.extend_from_slice(&(m3.len() as u16).to_be_bytes());
        tail.extend_from_slice(&m3);
        tail.push(0x5A); // one smuggled byte
        write_half.write_all(&tail).await.unwrap();
        write_half.flush().await.unwrap();

        let err = responder.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::HandshakeResidue));
    }

    #[tokio::test]
    async fn junk_after_server_reply_fails_initiator_with_residue() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let (conn_c, conn_s) = duplex(4096);

        // Hand-rolled responder that appends junk after its only message.
        let server_kp = server.clone();
        let responder = tokio::spawn(async move {
            let mut hs = SessionHandshake::responder(&server_kp).unwrap();
            let (read_half, mut write_half) = tokio::io::split(conn_s);
            let mut reader = BufReader::new(read_half);

            let m1 = read_message(&mut reader).await.unwrap();
            hs.read_message(&m1).unwrap();

            let m2 = hs.write_message(&[]).unwrap();
            let mut tail = Vec::new();
            tail.extend_from_slice(&(m2.len() as u16).to_be_bytes());
            tail.extend_from_slice(&m2);
            tail.push(0xA5);
            write_half.write_all(&tail).await.unwrap();
            write_half.flush().await.unwrap();
        });

        let err = initiate(conn_c, &client, server.public())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeResidue));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_handshake_message_is_rejected() {
        let server = Keypair::generate();
        let (mut conn_c, conn_s) = duplex(4096);

        let server_kp = server.clone();
        let responder = tokio::spawn(async move { respond(conn_s, &server_kp).await });

        conn_c
            .write_all(&(MAX_HANDSHAKE_MESSAGE as u16 + 1).to_be_bytes())
            .await
            .unwrap();
        let err = responder.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::FrameTooLarge(_)));
    }
}
