//! multistream-select
//!
//! Messages are `uvarint(len) payload '\n'`. The dialer sends the
//! `/multistream/1.0.0` header and then proposes protocols one at a time;
//! the listener echoes an accepted proposal or answers `na`.

use crate::varint;
use bytes::BytesMut;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Header protocol id
pub const PROTOCOL: &str = "/multistream/1.0.0";

const NA: &str = "na";
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Negotiation errors
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol not supported: {0}")]
    NotSupported(String),
    #[error("Unexpected multistream header: {0}")]
    BadHeader(String),
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Write one message
pub async fn write_message<W: AsyncWrite + Unpin>(io: &mut W, message: &str) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(message.len() + 3);
    varint::encode(message.len() as u64 + 1, &mut buf);
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\n");
    io.write_all(&buf).await?;
    io.flush().await
}

/// Read one message
pub async fn read_message<R: AsyncRead + Unpin>(io: &mut R) -> Result<String, NegotiationError> {
    let length = varint::read(io).await? as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(NegotiationError::TooLarge(length));
    }

    let mut buf = vec![0u8; length];
    io.read_exact(&mut buf).await?;
    match buf.pop() {
        Some(b'\n') => {}
        _ => return Err(NegotiationError::InvalidMessage("missing newline".into())),
    }
    String::from_utf8(buf).map_err(|e| NegotiationError::InvalidMessage(e.to_string()))
}

/// Dialer: exchange the multistream header
pub async fn handshake<S>(io: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(io, PROTOCOL).await?;
    let header = read_message(io).await?;
    if header != PROTOCOL {
        return Err(NegotiationError::BadHeader(header));
    }
    Ok(())
}

/// Dialer: propose `protocol`
pub async fn select<S>(io: &mut S, protocol: &str) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(io, protocol).await?;
    let reply = read_message(io).await?;
    if reply == protocol {
        debug!("Selected {}", protocol);
        Ok(())
    } else if reply == NA {
        Err(NegotiationError::NotSupported(protocol.to_string()))
    } else {
        Err(NegotiationError::InvalidMessage(reply))
    }
}

/// Dialer: header exchange followed by a single proposal
pub async fn dial<S>(io: &mut S, protocol: &str) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake(io).await?;
    select(io, protocol).await
}

/// Listener: answer proposals until `lookup` accepts one
///
/// A repeated header is echoed, so a dialer may restart negotiation on a
/// stream it already negotiated once.
pub async fn negotiate<S, H, F>(io: &mut S, lookup: F) -> Result<(String, H), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str) -> Option<H>,
{
    let header = read_message(io).await?;
    if header != PROTOCOL {
        return Err(NegotiationError::BadHeader(header));
    }
    write_message(io, PROTOCOL).await?;

    loop {
        let proposal = read_message(io).await?;
        if proposal == PROTOCOL {
            write_message(io, PROTOCOL).await?;
            continue;
        }
        match lookup(&proposal) {
            Some(found) => {
                write_message(io, &proposal).await?;
                return Ok((proposal, found));
            }
            None => {
                debug!("Rejecting proposal {}", proposal);
                write_message(io, NA).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(protocol: &str) -> Option<u8> {
        match protocol {
            "/echo/1.0.0" => Some(1),
            "/plaintext/1.0.0" => Some(2),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_select_supported() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let listener = tokio::spawn(async move { negotiate(&mut b, lookup).await.unwrap() });

        dial(&mut a, "/echo/1.0.0").await.unwrap();
        assert_eq!(listener.await.unwrap(), ("/echo/1.0.0".to_string(), 1));
    }

    #[tokio::test]
    async fn test_na_then_retry() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let listener = tokio::spawn(async move { negotiate(&mut b, lookup).await.unwrap() });

        handshake(&mut a).await.unwrap();
        let err = select(&mut a, "/bananas/1.0.0").await.unwrap_err();
        assert!(matches!(err, NegotiationError::NotSupported(p) if p == "/bananas/1.0.0"));

        select(&mut a, "/plaintext/1.0.0").await.unwrap();
        assert_eq!(listener.await.unwrap().1, 2);
    }

    #[tokio::test]
    async fn test_repeated_header_echoed() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let listener = tokio::spawn(async move { negotiate(&mut b, lookup).await.unwrap() });

        handshake(&mut a).await.unwrap();
        handshake(&mut a).await.unwrap();
        select(&mut a, "/echo/1.0.0").await.unwrap();
        assert_eq!(listener.await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_bad_header() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, "/multistream/9.9.9").await.unwrap();
        let err = negotiate(&mut b, lookup).await.unwrap_err();
        assert!(matches!(err, NegotiationError::BadHeader(_)));
    }
}
