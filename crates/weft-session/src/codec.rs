//! Length-delimited, session-encrypted record framing.
//!
//! Wire layout per frame: `u32` big-endian length, then the sealed bytes
//! (explicit nonce + ciphertext). Reads are bounded by `MAX_FRAME`. A
//! substream has exactly one writer and one reader at a time; the session
//! cipher itself may be shared across substreams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use weft_core::{MAX_FRAME, MAX_NOISE_MESSAGE};
use weft_crypto::{SessionCipher, SESSION_FRAME_OVERHEAD};
use weft_proto::{DialRequest, DialResponse};

use crate::SessionError;

/// Largest plaintext that fits one sealed frame.
pub(crate) const MAX_PLAINTEXT: usize = MAX_NOISE_MESSAGE - SESSION_FRAME_OVERHEAD;

/// Seals `plaintext` under the session cipher and writes one frame.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    cipher: &SessionCipher,
    plaintext: &[u8],
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    if plaintext.len() > MAX_PLAINTEXT {
        return Err(SessionError::FrameTooLarge(plaintext.len()));
    }
    let sealed = cipher.seal(plaintext).map_err(SessionError::Crypto)?;
    let mut frame = Vec::with_capacity(4 + sealed.len());
    frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&sealed);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame and opens it under the session cipher.
///
/// A clean EOF before the length prefix maps to `SubStreamClosed`; EOF
/// inside a frame maps to `ShortRead`.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    cipher: &SessionCipher,
) -> Result<Vec<u8>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => SessionError::SubStreamClosed,
            _ => SessionError::Io(e),
        })?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(SessionError::FrameTooLarge(len));
    }
    let mut sealed = vec![0u8; len];
    reader
        .read_exact(&mut sealed)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => SessionError::ShortRead,
            _ => SessionError::Io(e),
        })?;
    cipher.open(&sealed).map_err(|_| SessionError::DecryptFailed)
}

/// Writes a dial request through the session codec.
pub(crate) async fn write_request<W>(
    writer: &mut W,
    cipher: &SessionCipher,
    request: &DialRequest,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, cipher, &request.encode()).await
}

/// Reads a dial request through the session codec.
pub(crate) async fn read_request<R>(
    reader: &mut R,
    cipher: &SessionCipher,
) -> Result<DialRequest, SessionError>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_frame(reader, cipher).await?;
    DialRequest::decode(&bytes).map_err(SessionError::from_proto)
}

/// Writes a dial response through the session codec.
pub(crate) async fn write_response<W>(
    writer: &mut W,
    cipher: &SessionCipher,
    response: &DialResponse,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, cipher, &response.encode()).await
}

/// Reads a dial response through the session codec.
pub(crate) async fn read_response<R>(
    reader: &mut R,
    cipher: &SessionCipher,
) -> Result<DialResponse, SessionError>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_frame(reader, cipher).await?;
    DialResponse::decode(&bytes).map_err(SessionError::from_proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use weft_crypto::{Keypair, SessionHandshake};

    /// In-memory XK handshake yielding a client/server cipher pair.
    fn cipher_pair() -> (SessionCipher, SessionCipher) {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let mut init = SessionHandshake::initiator(&client, &server.public()).unwrap();
        let mut resp = SessionHandshake::responder(&server).unwrap();

        let m1 = init.write_message(&[]).unwrap();
        resp.read_message(&m1).unwrap();
        let m2 = resp.write_message(&[]).unwrap();
        init.read_message(&m2).unwrap();
        let m3 = init.write_message(client.public().as_bytes()).unwrap();
        resp.read_message(&m3).unwrap();

        let (c, _) = init.into_transport().unwrap();
        let (s, _) = resp.into_transport().unwrap();
        (c, s)
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (c, s) = cipher_pair();
        let (mut a, mut b) = duplex(4096);

        write_frame(&mut a, &c, b"hello relay").await.unwrap();
        let plain = read_frame(&mut b, &s).await.unwrap();
        assert_eq!(plain, b"hello relay");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (_c, s) = cipher_pair();
        let (mut a, mut b) = duplex(64);

        let len = (MAX_FRAME as u32) + 1;
        tokio::spawn(async move {
            a.write_all(&len.to_be_bytes()).await.unwrap();
        });
        assert!(matches!(
            read_frame(&mut b, &s).await,
            Err(SessionError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn oversized_plaintext_is_rejected_before_writing() {
        let (c, _s) = cipher_pair();
        let (mut a, _b) = duplex(64);
        let huge = vec![0u8; MAX_PLAINTEXT + 1];
        assert!(matches!(
            write_frame(&mut a, &c, &huge).await,
            Err(SessionError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn corrupted_frame_fails_decryption() {
        let (c, s) = cipher_pair();
        let (mut a, mut b) = duplex(4096);

        let sealed = c.seal(b"payload").unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&sealed);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        tokio::spawn(async move {
            a.write_all(&frame).await.unwrap();
        });

        assert!(matches!(
            read_frame(&mut b, &s).await,
            Err(SessionError::DecryptFailed)
        ));
    }

    #[tokio::test]
    async fn clean_eof_maps_to_substream_closed() {
        let (_c, s) = cipher_pair();
        let (a, mut b) = duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b, &s).await,
            Err(SessionError::SubStreamClosed)
        ));
    }

    #[tokio::test]
    async fn eof_inside_frame_maps_to_short_read() {
        let (_c, s) = cipher_pair();
        let (mut a, mut b) = duplex(64);
        tokio::spawn(async move {
            // Announce 100 bytes but deliver only 3.
            a.write_all(&100u32.to_be_bytes()).await.unwrap();
            a.write_all(&[1, 2, 3]).await.unwrap();
        });
        assert!(matches!(
            read_frame(&mut b, &s).await,
            Err(SessionError::ShortRead)
        ));
    }
}
