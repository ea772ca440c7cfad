use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use strum_macros::{Display, EnumString};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::frame::Frame;
use crate::Error;

/// Kind of socket a connection is dialed over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

/// Any duplex byte stream a connection can run over.
pub trait Duplex: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + 'static {}

type BoxedStream = Box<dyn Duplex + Unpin>;

/// A duplex byte stream with buffered, frame-aware reading and writing.
pub struct Transport {
    reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    writer: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    peer: String,
}

impl Transport {
    /// Dials `address`. With a deadline, failing to connect in time yields [`Error::Timeout`].
    pub async fn open(
        network: Network,
        address: &str,
        deadline: Option<Duration>,
        codec: FrameCodec,
    ) -> Result<Transport, Error> {
        let connect = dial(network, address);

        let stream = match deadline {
            Some(deadline) => timeout(deadline, connect)
                .await
                .map_err(|_| Error::Timeout(deadline))??,
            None => connect.await?,
        };

        debug!(%network, address, "dialed");

        Ok(Transport::new(stream, address.to_string(), codec))
    }

    pub fn new<S>(stream: S, peer: String, codec: FrameCodec) -> Transport
    where
        S: Duplex + Unpin,
    {
        let stream: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);

        Transport {
            // Allocate the read buffer with 4kb of capacity.
            reader: FramedRead::with_capacity(read_half, codec.clone(), 4096),
            writer: FramedWrite::new(write_half, codec),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn split(self) -> (TransportReader, TransportWriter) {
        (
            TransportReader {
                inner: self.reader,
            },
            TransportWriter {
                inner: Some(self.writer),
            },
        )
    }
}

async fn dial(network: Network, address: &str) -> io::Result<BoxedStream> {
    match network {
        Network::Tcp => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(address).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix domain sockets are not supported on this platform",
        )),
    }
}

pub struct TransportReader {
    inner: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
}

impl TransportReader {
    /// Reads the next complete frame. `Ok(None)` means the peer closed the stream cleanly between
    /// frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        self.inner.next().await.transpose()
    }
}

pub struct TransportWriter {
    // `None` once closed.
    inner: Option<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
}

impl TransportWriter {
    /// Buffers `command` and flushes it to the socket.
    pub async fn write_command(&mut self, command: Command) -> Result<(), Error> {
        self.feed_command(command).await?;
        self.flush().await
    }

    /// Encodes `command` into the write buffer without flushing it.
    ///
    /// When the buffer is over its limit this first waits for the socket to drain. Dropping the
    /// future while it waits leaves the buffer untouched; once it resolves the command is buffered
    /// and goes out with the next flush.
    pub async fn feed_command(&mut self, command: Command) -> Result<(), Error> {
        let writer = self.inner.as_mut().ok_or(Error::NotConnected)?;
        writer.feed(command).await
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        let writer = self.inner.as_mut().ok_or(Error::NotConnected)?;
        SinkExt::<Command>::flush(writer).await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Flushes and shuts the write half down. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<(), Error> {
        let Some(mut writer) = self.inner.take() else {
            return Ok(());
        };

        match SinkExt::<Command>::close(&mut writer).await {
            Ok(()) => Ok(()),
            // The peer may already be gone, e.g. after `QUIT`.
            Err(Error::Io(err)) if is_disconnect(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}
