//! Request/response multiplexing over one framed duplex stream.
//!
//! A [`Link`] is the handle the rest of the broker holds; [`drive`] owns the
//! stream halves and runs until the peer disconnects or the link is closed.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::net::connection::ConnectionId;
use crate::net::framing::{read_frame, write_frame};
use crate::protocol::frame::Frame;

/// Failure of a single exchange over a link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer rejected request: {0}")]
    Remote(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A request or message initiated by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Request { id: u32, data: String },
    Fire { data: String },
}

/// Why a driven link stopped.
#[derive(Debug)]
pub enum LinkEnd {
    /// Peer closed the stream.
    Eof,
    /// Closed locally via [`Link::close`].
    Closed,
    /// Transport error.
    Failed(io::Error),
}

type PendingMap = HashMap<u32, oneshot::Sender<Result<String, LinkError>>>;

/// Frames queued for the writer half of a link.
pub struct Outbound(mpsc::UnboundedReceiver<Frame>);

/// Handle to a live framed stream.
pub struct Link {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<PendingMap>,
    next_request: AtomicU32,
    closed: watch::Sender<bool>,
}

impl Link {
    pub fn new(id: ConnectionId) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let link = Arc::new(Self {
            id,
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU32::new(1),
            closed,
        });
        (link, Outbound(rx))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, data: impl Into<String>, timeout: Duration) -> Result<String, LinkError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if self.is_closed()
            || self
                .outbound
                .send(Frame::Request { id, data: data.into() })
                .is_err()
        {
            self.pending().remove(&id);
            return Err(LinkError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.pending().remove(&id);
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    /// Answer a peer-initiated request.
    pub fn respond(&self, id: u32, result: Result<String, String>) -> Result<(), LinkError> {
        let frame = match result {
            Ok(data) => Frame::Response { id, data },
            Err(message) => Frame::Error { id, message },
        };
        self.send(frame)
    }

    /// Stop the link. Outstanding requests fail with [`LinkError::Closed`].
    pub fn close(&self) {
        self.closed.send_replace(true);
        let drained: Vec<_> = self.pending().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(LinkError::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.outbound.send(frame).map_err(|_| LinkError::Closed)
    }

    fn complete(&self, id: u32, result: Result<String, LinkError>) {
        match self.pending().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(connection_id = %self.id, request_id = id, "Response for unknown request"),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pump frames between the stream halves and `link` until either side stops.
///
/// Peer-initiated frames are handed to `on_inbound`, which must not block.
/// The link is closed when this returns.
pub async fn drive<R, W, F>(link: &Link, mut reader: R, mut writer: W, outbound: Outbound, mut on_inbound: F) -> LinkEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(Inbound),
{
    let end = tokio::select! {
        err = read_loop(link, &mut reader, &mut on_inbound) => {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                LinkEnd::Eof
            } else {
                LinkEnd::Failed(err)
            }
        }
        res = write_loop(&mut writer, outbound) => match res {
            Ok(()) => LinkEnd::Closed,
            Err(e) => LinkEnd::Failed(e),
        },
        _ = link.closed() => LinkEnd::Closed,
    };
    link.close();
    end
}

async fn read_loop<R, F>(link: &Link, reader: &mut R, on_inbound: &mut F) -> io::Error
where
    R: AsyncRead + Unpin,
    F: FnMut(Inbound),
{
    loop {
        let bytes = match read_frame(reader).await {
            Ok(bytes) => bytes,
            Err(e) => return e,
        };
        match Frame::decode(&bytes) {
            Ok(Frame::Response { id, data }) => link.complete(id, Ok(data)),
            Ok(Frame::Error { id, message }) => link.complete(id, Err(LinkError::Remote(message))),
            Ok(Frame::Request { id, data }) => on_inbound(Inbound::Request { id, data }),
            Ok(Frame::Fire { data }) => on_inbound(Inbound::Fire { data }),
            Err(e) => {
                tracing::warn!(connection_id = %link.id(), error = %e, "Discarding undecodable frame");
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(writer: &mut W, mut outbound: Outbound) -> io::Result<()> {
    while let Some(frame) = outbound.0.recv().await {
        let bytes = frame
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(writer, &bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    async fn read(reader: &mut (impl AsyncRead + Unpin)) -> Frame {
        Frame::decode(&read_frame(reader).await.unwrap()).unwrap()
    }

    async fn write(writer: &mut (impl AsyncWrite + Unpin), frame: Frame) {
        write_frame(writer, &frame.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn request_is_matched_to_response() {
        let (local, remote) = duplex(4096);
        let (link, outbound) = Link::new(ConnectionId::new());
        let (r, w) = split(local);
        let driver = {
            let link = link.clone();
            tokio::spawn(async move { drive(&link, r, w, outbound, |_| {}).await })
        };

        let (mut peer_r, mut peer_w) = split(remote);
        let peer = tokio::spawn(async move {
            let Frame::Request { id, data } = read(&mut peer_r).await else {
                panic!("expected request");
            };
            assert_eq!(data, "ping");
            write(&mut peer_w, Frame::Response { id, data: "pong".into() }).await;
            (peer_r, peer_w)
        });

        let reply = link.request("ping", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, "pong");

        let (peer_r, peer_w) = peer.await.unwrap();
        drop((peer_r, peer_w));
        assert!(matches!(driver.await.unwrap(), LinkEnd::Eof));
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn remote_error_fails_only_that_request() {
        let (local, remote) = duplex(4096);
        let (link, outbound) = Link::new(ConnectionId::new());
        let (r, w) = split(local);
        let driver_link = link.clone();
        tokio::spawn(async move { drive(&driver_link, r, w, outbound, |_| {}).await });

        let (mut peer_r, mut peer_w) = split(remote);
        tokio::spawn(async move {
            let Frame::Request { id, .. } = read(&mut peer_r).await else { return };
            write(&mut peer_w, Frame::Error { id, message: "nope".into() }).await;
            let Frame::Request { id, .. } = read(&mut peer_r).await else { return };
            write(&mut peer_w, Frame::Response { id, data: "ok".into() }).await;
            std::future::pending::<()>().await;
        });

        let first = link.request("a", Duration::from_secs(5)).await;
        assert_eq!(first, Err(LinkError::Remote("nope".into())));
        let second = link.request("b", Duration::from_secs(5)).await;
        assert_eq!(second.as_deref(), Ok("ok"));
        assert!(!link.is_closed());
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests_and_stops_driver() {
        let (local, _remote) = duplex(4096);
        let (link, outbound) = Link::new(ConnectionId::new());
        let (r, w) = split(local);
        let driver_link = link.clone();
        let driver = tokio::spawn(async move { drive(&driver_link, r, w, outbound, |_| {}).await });

        let waiting = {
            let link = link.clone();
            tokio::spawn(async move { link.request("never answered", Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        link.close();

        assert_eq!(waiting.await.unwrap(), Err(LinkError::Closed));
        assert!(matches!(driver.await.unwrap(), LinkEnd::Closed));
        assert_eq!(link.respond(1, Ok("late".into())), Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn request_times_out() {
        let (local, _remote) = duplex(4096);
        let (link, outbound) = Link::new(ConnectionId::new());
        let (r, w) = split(local);
        let driver_link = link.clone();
        tokio::spawn(async move { drive(&driver_link, r, w, outbound, |_| {}).await });

        let result = link.request("slow", Duration::from_millis(50)).await;
        assert_eq!(result, Err(LinkError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn peer_requests_reach_inbound_handler() {
        let (local, remote) = duplex(4096);
        let (link, outbound) = Link::new(ConnectionId::new());
        let (r, w) = split(local);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver_link = link.clone();
        tokio::spawn(async move {
            drive(&driver_link, r, w, outbound, move |inbound| {
                let _ = tx.send(inbound);
            })
            .await
        });

        let (_peer_r, mut peer_w) = split(remote);
        write_frame(&mut peer_w, b"garbage").await.unwrap();
        write(&mut peer_w, Frame::Fire { data: "hello".into() }).await;
        write(&mut peer_w, Frame::Request { id: 3, data: "q".into() }).await;

        assert_eq!(rx.recv().await, Some(Inbound::Fire { data: "hello".into() }));
        assert_eq!(rx.recv().await, Some(Inbound::Request { id: 3, data: "q".into() }));
    }
}
