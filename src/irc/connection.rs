use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::app::event::{AppEvent, TransportId};
use crate::error::ClientError;
use crate::irc::codec::{CodecError, LineCodec};
use crate::irc::resolver::Endpoint;

/// One live byte stream to a server: a reader task posting decoded
/// messages to the event channel and a writer task draining `lines`.
pub struct Transport {
    pub id: TransportId,
    pub endpoint: Endpoint,
    pub peer: SocketAddr,
    lines: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    pub fn send(&self, line: String) -> Result<(), ClientError> {
        trace!(transport = self.id, %line, "send");
        self.lines
            .send(line)
            .map_err(|_| ClientError::Transport("Socket is not connected.".into()))
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn codec_error(err: CodecError) -> ClientError {
    match err {
        CodecError::Decode(e) => ClientError::Decode(e),
        CodecError::Io(e) => ClientError::from_io(&e),
    }
}

/// Open a TCP stream to `endpoint` and start its reader and writer tasks.
///
/// Every failure after the connect (read error, malformed line, EOF, write
/// error) is reported once as [`AppEvent::TransportFailed`].
pub async fn open_transport(
    id: TransportId,
    endpoint: Endpoint,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) -> Result<Transport, ClientError> {
    let stream = TcpStream::connect((endpoint.address.as_str(), endpoint.port)).await?;
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();

    let mut frames = FramedRead::new(read_half, LineCodec);
    let reader_tx = event_tx.clone();
    let reader = tokio::spawn(async move {
        let error = loop {
            match frames.next().await {
                Some(Ok(message)) => {
                    if reader_tx.send(AppEvent::Message { transport: id, message }).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break codec_error(e),
                None => break ClientError::Transport("Connection closed by server.".into()),
            }
        };
        debug!(transport = id, %error, "reader stopped");
        let _ = reader_tx.send(AppEvent::TransportFailed { transport: id, error });
    });

    let (lines, mut outgoing) = mpsc::unbounded_channel::<String>();
    let mut sink = FramedWrite::new(write_half, LineCodec);
    let writer = tokio::spawn(async move {
        while let Some(line) = outgoing.recv().await {
            if let Err(e) = sink.send(line).await {
                let _ = event_tx.send(AppEvent::TransportFailed {
                    transport: id,
                    error: codec_error(e),
                });
                return;
            }
        }
    });

    Ok(Transport {
        id,
        endpoint,
        peer,
        lines,
        reader,
        writer,
    })
}
