//! TCP transport to the debuggee.
//!
//! Owns the socket and the frame codec. Two tasks per connection: a reader
//! that decodes frames and pushes them onto the session's inbound queue,
//! and a single writer that drains an outbound queue. The writer is the only
//! task touching the sink, so frames can never interleave.
//!
//! Mid-session EOF and decode errors both surface as a synthetic
//! [`LinkEvent::Closed`]; a decode error additionally means the stream is
//! desynchronized, so the connection is torn down rather than resumed.

use futures_util::{SinkExt, StreamExt};
use nb_protocol::{FrameCodec, ProtocolMessage, WireRequest};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Queue depths. Inbound is bounded so a stalled controller applies
/// backpressure to the socket instead of buffering without limit.
const INBOUND_QUEUE: usize = 64;
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection closed")]
    Closed,
}

/// An item from the reader task.
#[derive(Debug)]
pub enum LinkEvent {
    Message(ProtocolMessage),
    /// The connection is gone: EOF, socket error, or a desynchronized
    /// stream. Emitted exactly once, last.
    Closed,
}

/// Handle to one live debugger connection.
#[derive(Debug)]
pub struct DebuggerLink {
    outbound: mpsc::Sender<WireRequest>,
    shutdown: watch::Sender<bool>,
}

impl DebuggerLink {
    /// Connect and spawn the reader/writer tasks. Decoded messages and the
    /// final `Closed` arrive on `events`.
    pub async fn connect(
        host: &str,
        port: u16,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Self, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        debug!(%addr, "connected to debugger");

        let framed = Framed::new(stream, FrameCodec::new());
        let (mut sink, mut source) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<WireRequest>(OUTBOUND_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);

        // Writer: sole owner of the sink half.
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = writer_shutdown.changed() => {
                        if *writer_shutdown.borrow() { break; }
                    }
                    req = outbound_rx.recv() => {
                        let Some(req) = req else { break };
                        if let Err(e) = sink.send(ProtocolMessage::Request(req)).await {
                            warn!(error = %e, "write failed");
                            break;
                        }
                    }
                }
            }
        });

        // Reader: decodes frames until EOF/error, then emits Closed.
        let mut reader_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reader_shutdown.changed() => {
                        if *reader_shutdown.borrow() { break; }
                    }
                    frame = source.next() => {
                        match frame {
                            Some(Ok(msg)) => {
                                if events.send(LinkEvent::Message(msg)).await.is_err() {
                                    return; // controller gone
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "stream desynchronized, closing");
                                break;
                            }
                            None => {
                                debug!("debugger closed the connection");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = events.send(LinkEvent::Closed).await;
        });

        Ok(Self { outbound, shutdown })
    }

    /// Queue one request for the writer task.
    pub async fn send(&self, req: WireRequest) -> Result<(), TransportError> {
        self.outbound
            .send(req)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Signal both tasks to stop. Queued writes are abandoned; the reader
    /// emits its final `Closed` event.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Build the bounded inbound queue for one connection.
pub fn inbound_queue() -> (mpsc::Sender<LinkEvent>, mpsc::Receiver<LinkEvent>) {
    mpsc::channel(INBOUND_QUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_protocol::{Event, commands};

    async fn accept_one(listener: tokio::net::TcpListener) -> Framed<TcpStream, FrameCodec> {
        let (stream, _) = listener.accept().await.unwrap();
        Framed::new(stream, FrameCodec::new())
    }

    #[tokio::test]
    async fn connect_refused_is_a_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let (tx, _rx) = inbound_queue();
        let err = DebuggerLink::connect("127.0.0.1", port, tx).await;
        assert!(matches!(err, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn requests_are_framed_onto_the_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, _rx) = inbound_queue();
        let link = DebuggerLink::connect("127.0.0.1", port, tx).await.unwrap();
        let mut server = accept_one(listener).await;

        let mut dispatcher = crate::dispatcher::RequestDispatcher::new();
        link.send(dispatcher.make_request(commands::scripts()))
            .await
            .unwrap();

        let msg = server.next().await.unwrap().unwrap();
        match msg {
            ProtocolMessage::Request(req) => {
                assert_eq!(req.command, "scripts");
                assert_eq!(req.seq, 1);
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_messages_and_eof_arrive_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = inbound_queue();
        let _link = DebuggerLink::connect("127.0.0.1", port, tx).await.unwrap();
        let mut server = accept_one(listener).await;

        server
            .send(ProtocolMessage::Event(Event {
                event: "afterCompile".to_owned(),
                body: None,
            }))
            .await
            .unwrap();
        drop(server);

        match rx.recv().await.unwrap() {
            LinkEvent::Message(ProtocolMessage::Event(e)) => {
                assert_eq!(e.event, "afterCompile");
            }
            other => panic!("expected event, got {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::Closed));
    }

    #[tokio::test]
    async fn garbage_on_the_wire_tears_down_the_connection() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = inbound_queue();
        let _link = DebuggerLink::connect("127.0.0.1", port, tx).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        stream.write_all(b"NotAHeader\r\n\r\n").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::Closed));
    }

    #[tokio::test]
    async fn close_emits_final_closed_event() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = inbound_queue();
        let link = DebuggerLink::connect("127.0.0.1", port, tx).await.unwrap();
        let _server = accept_one(listener).await;

        link.close();
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::Closed));
    }
}
