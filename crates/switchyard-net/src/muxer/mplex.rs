//! mplex stream multiplexer
//!
//! Wire format: `uvarint(id << 3 | flag) uvarint(len) data`. Stream ids are
//! allocated independently by each side, so a stream is keyed by its id
//! plus whether it was opened locally.
//!
//! A session runs two tasks: the driver reads frames and routes them to
//! per-stream channels, the writer serializes outgoing frames. Each stream
//! is a duplex pipe whose far end is pumped by its own task.

use super::{MuxedConnection, MuxerError, StreamMuxer};
use crate::connection::{Connection, ConnectionInfo, Io};
use crate::varint;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, trace};

/// Protocol id of mplex
pub const MPLEX_CODEC: &str = "/mplex/6.7.0";

/// Maximum frame payload (1 MB)
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Largest chunk read from a local stream per frame
const MAX_CHUNK: usize = 64 * 1024;
const STREAM_PIPE: usize = 256 * 1024;
/// Buffered frames per stream and for the writer
const CHANNEL_CAPACITY: usize = 64;
/// Inbound streams waiting for `accept`
const ACCEPT_BACKLOG: usize = 16;

/// Frame flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Flag {
    NewStream = 0,
    MessageReceiver = 1,
    MessageInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl TryFrom<u8> for Flag {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NewStream),
            1 => Ok(Self::MessageReceiver),
            2 => Ok(Self::MessageInitiator),
            3 => Ok(Self::CloseReceiver),
            4 => Ok(Self::CloseInitiator),
            5 => Ok(Self::ResetReceiver),
            6 => Ok(Self::ResetInitiator),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown mplex flag: {}", value),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Frame {
    id: u64,
    flag: Flag,
    data: Bytes,
}

impl Frame {
    fn new(id: u64, flag: Flag, data: Bytes) -> Self {
        Self { id, flag, data }
    }
}

/// Codec for mplex frames
#[derive(Default)]
struct MplexCodec;

impl Decoder for MplexCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((header, header_len)) = varint::decode(src)? else {
            return Ok(None);
        };
        let Some((length, length_len)) = varint::decode(&src[header_len..])? else {
            return Ok(None);
        };
        let length = length as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", length),
            ));
        }

        let total = header_len + length_len + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len + length_len);
        let data = src.split_to(length).freeze();
        let flag = Flag::try_from((header & 0x07) as u8)?;
        Ok(Some(Frame::new(header >> 3, flag, data)))
    }
}

impl Encoder<Frame> for MplexCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Frame too large: {} bytes", item.data.len()),
            ));
        }
        varint::encode(item.id << 3 | item.flag as u64, dst);
        varint::encode(item.data.len() as u64, dst);
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}

/// (stream id, opened locally)
type StreamKey = (u64, bool);
type StreamMap = Arc<Mutex<HashMap<StreamKey, mpsc::Sender<Bytes>>>>;

/// mplex codec
#[derive(Clone, Copy, Debug, Default)]
pub struct Mplex;

impl StreamMuxer for Mplex {
    fn multicodec(&self) -> &str {
        MPLEX_CODEC
    }

    fn dialer(&self, conn: Connection) -> Arc<dyn MuxedConnection> {
        Arc::new(MplexConnection::new(conn))
    }

    fn listener(&self, conn: Connection) -> Arc<dyn MuxedConnection> {
        Arc::new(MplexConnection::new(conn))
    }
}

/// A running mplex session
pub struct MplexConnection {
    info: ConnectionInfo,
    out_tx: mpsc::Sender<Frame>,
    streams: StreamMap,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    next_id: AtomicU64,
    closed: Arc<watch::Sender<bool>>,
}

impl MplexConnection {
    /// Start the session tasks over `conn`
    pub fn new(conn: Connection) -> Self {
        let (io, info) = conn.into_parts();
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(watch::Sender::new(false));

        tokio::spawn(run_writer(
            FramedWrite::new(write_half, MplexCodec),
            out_rx,
            closed.clone(),
        ));
        tokio::spawn(run_driver(
            FramedRead::new(read_half, MplexCodec),
            Driver {
                info: info.clone(),
                out_tx: out_tx.clone(),
                streams: streams.clone(),
                inbound_tx,
            },
            closed.clone(),
        ));

        Self {
            info,
            out_tx,
            streams,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            next_id: AtomicU64::new(0),
            closed,
        }
    }
}

#[async_trait]
impl MuxedConnection for MplexConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn new_stream(&self) -> Result<Connection, MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.streams.lock().insert((id, true), tx);

        self.out_tx
            .send(Frame::new(id, Flag::NewStream, Bytes::from(id.to_string())))
            .await
            .map_err(|_| MuxerError::Closed)?;
        trace!("Opened mplex stream {}", id);

        let io = spawn_stream(id, true, self.out_tx.clone(), rx);
        Ok(Connection::new(io, self.info.clone()))
    }

    async fn accept(&self) -> Option<Connection> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Drop for MplexConnection {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

struct Driver {
    info: ConnectionInfo,
    out_tx: mpsc::Sender<Frame>,
    streams: StreamMap,
    inbound_tx: mpsc::Sender<Connection>,
}

impl Driver {
    async fn handle(&self, frame: Frame) {
        match frame.flag {
            Flag::NewStream => {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                self.streams.lock().insert((frame.id, false), tx);
                let io = spawn_stream(frame.id, false, self.out_tx.clone(), rx);
                trace!("Remote opened mplex stream {}", frame.id);
                if self
                    .inbound_tx
                    .send(Connection::new(io, self.info.clone()))
                    .await
                    .is_err()
                {
                    self.streams.lock().remove(&(frame.id, false));
                }
            }
            Flag::MessageInitiator => self.deliver((frame.id, false), frame.data).await,
            Flag::MessageReceiver => self.deliver((frame.id, true), frame.data).await,
            Flag::CloseInitiator | Flag::ResetInitiator => {
                self.streams.lock().remove(&(frame.id, false));
            }
            Flag::CloseReceiver | Flag::ResetReceiver => {
                self.streams.lock().remove(&(frame.id, true));
            }
        }
    }

    /// Hand a frame to its stream without waiting; a stream whose buffer
    /// is full is reset so it cannot stall the session
    async fn deliver(&self, key: StreamKey, data: Bytes) {
        let tx = self.streams.lock().get(&key).cloned();
        let Some(tx) = tx else {
            trace!("Dropping frame for unknown mplex stream {:?}", key);
            return;
        };
        match tx.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("mplex stream {:?} is not reading, resetting it", key);
                self.streams.lock().remove(&key);
                let (id, initiator) = key;
                let flag = if initiator {
                    Flag::ResetInitiator
                } else {
                    Flag::ResetReceiver
                };
                let _ = self.out_tx.send(Frame::new(id, flag, Bytes::new())).await;
            }
            Err(TrySendError::Closed(_)) => {
                self.streams.lock().remove(&key);
            }
        }
    }
}

async fn run_driver(
    mut frames: FramedRead<tokio::io::ReadHalf<Box<dyn Io>>, MplexCodec>,
    driver: Driver,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            _ = async {
                let _ = closed_rx.wait_for(|closed| *closed).await;
            } => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => driver.handle(frame).await,
                Some(Err(e)) => {
                    debug!("mplex read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    driver.streams.lock().clear();
    closed.send_replace(true);
}

async fn run_writer(
    mut sink: FramedWrite<tokio::io::WriteHalf<Box<dyn Io>>, MplexCodec>,
    mut out_rx: mpsc::Receiver<Frame>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            _ = async {
                let _ = closed_rx.wait_for(|closed| *closed).await;
            } => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!("mplex write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = SinkExt::<Frame>::close(&mut sink).await;
    closed.send_replace(true);
}

/// Spawn the pump for one stream and return the application end
fn spawn_stream(
    id: u64,
    initiator: bool,
    out_tx: mpsc::Sender<Frame>,
    mut from_remote: mpsc::Receiver<Bytes>,
) -> DuplexStream {
    let (app, pump) = tokio::io::duplex(STREAM_PIPE);
    let (message, close) = if initiator {
        (Flag::MessageInitiator, Flag::CloseInitiator)
    } else {
        (Flag::MessageReceiver, Flag::CloseReceiver)
    };

    tokio::spawn(async move {
        let (mut pump_read, mut pump_write) = tokio::io::split(pump);

        let outbound = async {
            let mut buf = vec![0u8; MAX_CHUNK];
            loop {
                let n = match pump_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let frame = Frame::new(id, message, Bytes::copy_from_slice(&buf[..n]));
                if out_tx.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = out_tx.send(Frame::new(id, close, Bytes::new())).await;
        };

        let inbound = async {
            while let Some(data) = from_remote.recv().await {
                if pump_write.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = pump_write.shutdown().await;
        };

        tokio::join!(outbound, inbound);
    });

    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pair;

    fn session_pair() -> (Arc<dyn MuxedConnection>, Arc<dyn MuxedConnection>) {
        let (a, b) = pair(64 * 1024);
        (Mplex.dialer(a), Mplex.listener(b))
    }

    #[test]
    fn test_codec_wire_format() {
        let mut codec = MplexCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(17, Flag::MessageInitiator, Bytes::from_static(b"hey")), &mut buf)
            .unwrap();

        // 17 << 3 | 2 = 138 = 0x8a 0x01
        assert_eq!(&buf[..], &[0x8a, 0x01, 0x03, b'h', b'e', b'y']);

        let mut partial = BytesMut::from(&buf[..4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.id, 17);
        assert_eq!(frame.flag, Flag::MessageInitiator);
        assert_eq!(&frame.data[..], b"hey");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_unknown_flag() {
        let mut codec = MplexCodec;
        let mut buf = BytesMut::from(&[0x07u8, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_streams_both_directions() {
        let (dialer, listener) = session_pair();

        let mut outbound = dialer.new_stream().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();

        let mut inbound = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Listener-opened stream uses the same id space independently
        let mut reverse = listener.new_stream().await.unwrap();
        reverse.write_all(b"back").await.unwrap();
        let mut accepted = dialer.accept().await.unwrap();
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn test_half_close() {
        let (dialer, listener) = session_pair();

        let mut outbound = dialer.new_stream().await.unwrap();
        outbound.write_all(b"request").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = listener.accept().await.unwrap();
        let mut request = Vec::new();
        inbound.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        inbound.write_all(b"response").await.unwrap();
        inbound.shutdown().await.unwrap();

        let mut response = Vec::new();
        outbound.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
    }

    #[tokio::test]
    async fn test_stalled_stream_does_not_block_session() {
        let (dialer, listener) = session_pair();

        let mut stalled = dialer.new_stream().await.unwrap();
        let mut flood = listener.accept().await.unwrap();
        let total = 256 * MAX_CHUNK;
        let writer = tokio::spawn(async move {
            let chunk = vec![7u8; MAX_CHUNK];
            for _ in 0..256 {
                if flood.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::timeout(std::time::Duration::from_secs(10), writer)
            .await
            .expect("writer not blocked by the stalled reader")
            .unwrap();

        // Other streams keep working
        let mut outbound = dialer.new_stream().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        let mut inbound = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The stalled stream was reset and ends short
        let mut received = Vec::new();
        stalled.read_to_end(&mut received).await.unwrap();
        assert!(received.len() < total);
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (dialer, listener) = session_pair();
        let _stream = dialer.new_stream().await.unwrap();

        dialer.close().await;
        dialer.closed().await;
        assert!(dialer.is_closed());

        listener.closed().await;
        assert!(listener.is_closed());
        // The stream may or may not have reached the listener before the close
        while listener.accept().await.is_some() {}
        assert!(matches!(dialer.new_stream().await, Err(MuxerError::Closed)));
    }
}
