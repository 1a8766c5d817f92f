//! One task per live connection.
//!
//! ```text
//!            ┌──────── ws read ────────┐
//!  socket ──►│ stamp → decode → relay  │──► RoomRegistry::broadcast (exclude self)
//!            │                         │
//!  socket ◄──│ outbound queue (bounded)│◄── fan-out from other members
//!            └──── evicted / closed ───┘
//!                        │
//!                        ▼
//!               RoomRegistry::remove   (single exit path)
//! ```
//!
//! The member moves OPEN → CLOSING when the loop decides to stop and
//! CLOSED inside `remove`, which runs exactly once whatever ended the loop.

use futures_util::{SinkExt, Stream, StreamExt};
use futures_util::sink::Sink;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::member::Member;
use crate::protocol::{ReceiptClock, RelayedEvent};
use crate::registry::RoomRegistry;
use crate::server::RelayStats;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the client
    ClientClosed,
    /// Read or write error on the socket
    TransportError,
    /// A write to the socket exceeded the send timeout
    SendTimeout,
    /// The relay evicted this member after a failed delivery
    Evicted,
}

/// Per-connection state driven by [`Session::run`].
pub struct Session {
    member: Arc<Member>,
    outbound: mpsc::Receiver<Message>,
    registry: Arc<RoomRegistry>,
    stats: Arc<RelayStats>,
    clock: ReceiptClock,
    send_timeout: Duration,
}

impl Session {
    /// Admit a new member into `room_key` and build its session.
    pub async fn admit(
        registry: Arc<RoomRegistry>,
        stats: Arc<RelayStats>,
        room_key: &str,
        peer: Option<std::net::SocketAddr>,
        outbound_capacity: usize,
        send_timeout: Duration,
    ) -> Self {
        let (tx, outbound) = mpsc::channel(outbound_capacity.max(1));
        let mut member = Member::new(room_key, tx);
        if let Some(addr) = peer {
            member = member.with_peer_addr(addr);
        }
        let member = registry.admit_member(member).await;

        Self {
            member,
            outbound,
            registry,
            stats,
            clock: ReceiptClock::new(),
            send_timeout,
        }
    }

    pub fn member(&self) -> &Arc<Member> {
        &self.member
    }

    /// Pump frames until the connection ends, then remove the member.
    ///
    /// Works over any framed transport; pings are answered by the WebSocket
    /// layer itself.
    pub async fn run<S, E>(mut self, socket: S) -> CloseReason
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
        E: fmt::Display,
    {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let reason = self.pump(&mut ws_sender, &mut ws_receiver).await;

        self.member.begin_close();
        self.registry.remove(&self.member).await;
        if reason == CloseReason::Evicted {
            self.stats.record_eviction();
        }
        // Best effort; the peer may already be gone.
        let _ = tokio::time::timeout(self.send_timeout, ws_sender.close()).await;

        log::info!(
            "Member {} ({}) disconnected from room {:?}: {reason:?}",
            self.member.id(),
            self.member
                .peer_addr()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string()),
            self.member.room()
        );
        reason
    }

    async fn pump<W, R, E>(&mut self, ws_sender: &mut W, ws_receiver: &mut R) -> CloseReason
    where
        W: Sink<Message, Error = E> + Unpin,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.relay(text.as_bytes()).await,
                        Some(Ok(Message::Binary(data))) => self.relay(&data).await,
                        Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error for member {}: {e}", self.member.id());
                            return CloseReason::TransportError;
                        }
                    }
                }

                outbound = self.outbound.recv() => {
                    let Some(frame) = outbound else {
                        return CloseReason::Evicted;
                    };
                    match tokio::time::timeout(self.send_timeout, ws_sender.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            log::warn!("Send to member {} failed: {e}", self.member.id());
                            return CloseReason::TransportError;
                        }
                        Err(_) => {
                            log::warn!(
                                "Send to member {} timed out after {:?}",
                                self.member.id(),
                                self.send_timeout
                            );
                            return CloseReason::SendTimeout;
                        }
                    }
                }

                _ = self.member.closed() => return CloseReason::Evicted,
            }
        }
    }

    /// Stamp, decode and fan out one inbound frame.
    async fn relay(&mut self, bytes: &[u8]) {
        let delivered_at = self.clock.stamp();

        let event = match RelayedEvent::from_frame(bytes, delivered_at) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_malformed();
                log::warn!(
                    "Dropping frame from member {} in room {:?}: {e}",
                    self.member.id(),
                    self.member.room()
                );
                return;
            }
        };

        let encoded = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode relayed event: {e}");
                return;
            }
        };

        let report = self
            .registry
            .broadcast(self.member.room(), &Message::text(encoded), Some(self.member.id()))
            .await;
        self.stats.record_relayed(report.delivered, report.failed.len());

        log::debug!(
            "Relayed frame in room {:?}: {} delivered, {} skipped, {} failed",
            self.member.room(),
            report.delivered,
            report.skipped,
            report.failed.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberState;
    use serde_json::Value;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite;

    /// In-memory socket: frames pushed into `inbound` are read by the
    /// session, frames the session writes land in `written`.
    struct FakeSocket {
        inbound: mpsc::UnboundedReceiver<Result<Message, tungstenite::Error>>,
        written: mpsc::UnboundedSender<Message>,
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, tungstenite::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_recv(cx)
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.written
                .send(item)
                .map_err(|_| tungstenite::Error::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Client {
        input: mpsc::UnboundedSender<Result<Message, tungstenite::Error>>,
        output: mpsc::UnboundedReceiver<Message>,
        member: Arc<Member>,
        task: tokio::task::JoinHandle<CloseReason>,
    }

    impl Client {
        async fn next_json(&mut self) -> Value {
            let frame = timeout(Duration::from_secs(1), self.output.recv())
                .await
                .expect("frame within timeout")
                .expect("socket open");
            match frame {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("Expected text frame, got {other:?}"),
            }
        }

        fn send(&self, text: &str) {
            self.input
                .send(Ok(Message::text(text.to_string())))
                .unwrap();
        }
    }

    async fn connect(registry: &Arc<RoomRegistry>, stats: &Arc<RelayStats>, room: &str) -> Client {
        let (input, inbound) = mpsc::unbounded_channel();
        let (written, output) = mpsc::unbounded_channel();
        let session = Session::admit(
            registry.clone(),
            stats.clone(),
            room,
            None,
            16,
            Duration::from_secs(1),
        )
        .await;
        let member = session.member().clone();
        let task = tokio::spawn(session.run(FakeSocket { inbound, written }));
        Client {
            input,
            output,
            member,
            task,
        }
    }

    #[tokio::test]
    async fn test_session_relays_with_delivered_at() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let mut a = connect(&registry, &stats, "/r1").await;
        assert_eq!(a.next_json().await["type"], "connected");
        let mut b = connect(&registry, &stats, "/r1").await;
        assert_eq!(b.next_json().await["connections"], 2);
        assert_eq!(a.next_json().await["type"], "user_joined");

        a.send(r#"{"kind":"edit","data":"x","deliveredAt":5}"#);
        let event = b.next_json().await;
        assert_eq!(event["kind"], "edit");
        assert_eq!(event["data"], "x");
        assert!(event["deliveredAt"].as_u64().unwrap() > 5);

        assert!(
            timeout(Duration::from_millis(100), a.output.recv()).await.is_err(),
            "Sender must not receive its own event"
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let mut a = connect(&registry, &stats, "/r1").await;
        let mut b = connect(&registry, &stats, "/r1").await;
        let _ = a.next_json().await;
        let _ = a.next_json().await;
        let _ = b.next_json().await;

        a.send("{not json");
        a.send("[1,2,3]");
        a.send(r#"{"kind":"after"}"#);

        let event = b.next_json().await;
        assert_eq!(event["kind"], "after");
        assert_eq!(a.member.state(), MemberState::Open);
        assert_eq!(stats.snapshot().malformed_frames, 2);
    }

    #[tokio::test]
    async fn test_delivered_at_monotonic_per_sender() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let a = connect(&registry, &stats, "/r1").await;
        let mut b = connect(&registry, &stats, "/r1").await;
        let _ = b.next_json().await;

        for i in 0..20 {
            a.send(&format!(r#"{{"seq":{i}}}"#));
        }

        let mut last = 0;
        for i in 0..20 {
            let event = b.next_json().await;
            assert_eq!(event["seq"], i, "FIFO per sender");
            let stamp = event["deliveredAt"].as_u64().unwrap();
            assert!(stamp >= last);
            last = stamp;
        }
    }

    #[tokio::test]
    async fn test_ping_is_left_to_the_websocket_layer() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let mut a = connect(&registry, &stats, "/r1").await;
        let _ = a.next_json().await;

        a.input.send(Ok(Message::Ping(vec![7u8, 7].into()))).unwrap();
        assert!(
            timeout(Duration::from_millis(100), a.output.recv()).await.is_err(),
            "Session must not queue its own pong"
        );
        assert_eq!(a.member.state(), MemberState::Open);
        assert_eq!(stats.snapshot().frames_relayed, 0);
    }

    #[tokio::test]
    async fn test_close_runs_cleanup_once() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let mut a = connect(&registry, &stats, "/r1").await;
        let b = connect(&registry, &stats, "/r1").await;
        let _ = a.next_json().await;
        let _ = a.next_json().await;

        b.input.send(Ok(Message::Close(None))).unwrap();
        assert_eq!(b.task.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(b.member.state(), MemberState::Closed);

        let left = a.next_json().await;
        assert_eq!(left["type"], "user_left");
        assert_eq!(left["connections"], 1);

        // Dropping the input ends A's stream; the room disappears with it.
        drop(a.input);
        assert_eq!(a.task.await.unwrap(), CloseReason::ClientClosed);
        assert!(registry.room_of("/r1").await.is_none());
    }

    #[tokio::test]
    async fn test_evicted_member_task_exits() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let a = connect(&registry, &stats, "/r1").await;
        registry.remove(&a.member).await;

        let reason = timeout(Duration::from_secs(1), a.task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Evicted);
        assert_eq!(stats.snapshot().evictions, 1);
    }

    #[tokio::test]
    async fn test_transport_error_removes_member() {
        let registry = Arc::new(RoomRegistry::new());
        let stats = Arc::new(RelayStats::default());

        let a = connect(&registry, &stats, "/r1").await;
        a.input
            .send(Err(tungstenite::Error::ConnectionClosed))
            .unwrap();
        assert_eq!(a.task.await.unwrap(), CloseReason::TransportError);
        assert!(registry.room_of("/r1").await.is_none());
    }
}
