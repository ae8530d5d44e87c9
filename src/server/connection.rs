//! Client connection handling
//!
//! One `Connection` runs per accepted socket. It performs the INFO/AUTH
//! handshake, then translates client frames into registry calls and writes
//! messages fanned out to it back to the socket.
//!
//! Outbound messages reach the socket through a bounded queue: the registry
//! pushes into it with `try_send` from the publisher's task, and this task
//! drains it. A full queue drops the message for this client only.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthKey;
use crate::error::Result;
use crate::protocol::constants::{ERR_ACCESS_FAIL, ERR_AUTH_FAIL};
use crate::protocol::{handshake, Frame, FrameCodec};
use crate::registry::{ConnectionHandle, DeliveryError, MessageSink, SubscriptionRegistry};
use crate::server::config::BrokerConfig;
use crate::session::SessionState;
use crate::stats::metrics;

/// A message queued for delivery to one client
#[derive(Debug)]
struct Outbound {
    source: String,
    channel: String,
    payload: Bytes,
}

/// Sink that feeds a connection's outbound queue
struct QueueSink {
    ak: String,
    tx: mpsc::Sender<Outbound>,
}

impl MessageSink for QueueSink {
    fn deliver(&self, source_ak: &str, channel: &str, payload: Bytes) -> std::result::Result<(), DeliveryError> {
        let msg = Outbound {
            source: source_ak.to_owned(),
            channel: channel.to_owned(),
            payload,
        };

        self.tx.try_send(msg).map_err(|e| {
            let (err, msg) = match e {
                TrySendError::Full(msg) => (DeliveryError::QueueFull, msg),
                TrySendError::Closed(msg) => (DeliveryError::Closed, msg),
            };
            // Never reaches the writer, so undo the fill here
            metrics::send_buffer_drained(&self.ak, msg.payload.len());
            err
        })
    }
}

/// Outcome of handling one client frame
enum Flow {
    Continue,
    Close,
}

/// A client connection
pub(crate) struct Connection<S> {
    state: SessionState,
    framed: Framed<S, FrameCodec>,
    config: Arc<BrokerConfig>,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        session_id: u64,
        stream: S,
        peer_addr: SocketAddr,
        config: Arc<BrokerConfig>,
        registry: Arc<SubscriptionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        let codec = FrameCodec::with_max_frame_size(config.max_message_size);
        Self {
            state: SessionState::new(session_id, peer_addr),
            framed: Framed::new(stream, codec),
            config,
            registry,
            shutdown,
        }
    }

    /// Run the session until the client disconnects or the broker shuts down
    pub(crate) async fn run(&mut self) -> Result<()> {
        let key = match self.authenticate().await {
            Ok(Some(key)) => key,
            Ok(None) => {
                self.state.closed();
                return Ok(());
            }
            Err(e) => {
                self.state.closed();
                return Err(e);
            }
        };

        let (tx, mut rx) = mpsc::channel(self.config.outbound_queue);
        let handle = Arc::new(ConnectionHandle::new(
            self.state.id,
            key.ident.clone(),
            QueueSink {
                ak: key.ident.clone(),
                tx,
            },
        ));
        self.registry.attach(Arc::clone(&handle));
        self.state.on_authenticated(&key.ident);

        tracing::info!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            ident = %key.ident,
            auth_ms = self.state.auth_latency().map_or(0, |d| d.as_millis() as u64),
            "Client authenticated"
        );

        let result = self.serve(&handle, &key, &mut rx).await;

        self.state.close();
        self.release(&handle, &mut rx);
        self.state.closed();

        tracing::debug!(
            session_id = self.state.id,
            ident = self.state.ident.as_deref().unwrap_or_default(),
            duration_ms = self.state.duration().as_millis() as u64,
            frames = self.state.frames_received,
            publishes = self.state.publishes,
            sent = self.state.messages_sent,
            "Session finished"
        );

        result
    }

    /// Send INFO and wait for a valid AUTH
    ///
    /// Returns `None` if the client failed to authenticate or went away.
    async fn authenticate(&mut self) -> Result<Option<AuthKey>> {
        let nonce = handshake::generate_nonce();
        self.framed
            .send(Frame::Info {
                name: self.config.name.clone(),
                nonce: Bytes::copy_from_slice(&nonce),
            })
            .await?;
        self.state.start_auth();

        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            frame = tokio::time::timeout(self.config.auth_timeout, self.framed.next()) => frame,
        };

        let frame = match first {
            Err(_) => {
                tracing::debug!(session_id = self.state.id, "Authentication timed out");
                return Ok(None);
            }
            Ok(None) => return Ok(None),
            Ok(Some(frame)) => frame?,
        };
        self.state.frames_received += 1;

        let opcode = frame.opcode();
        let Frame::Auth { ident, hash } = frame else {
            tracing::warn!(
                session_id = self.state.id,
                peer = %self.state.peer_addr,
                opcode = opcode,
                "First message was not AUTH"
            );
            self.framed.send(Frame::error(ERR_AUTH_FAIL)).await?;
            return Ok(None);
        };

        match self.registry.get_auth_key(&ident).await {
            Some(key) if handshake::verify(&nonce, &key.secret, &hash) => Ok(Some(key)),
            lookup => {
                tracing::warn!(
                    session_id = self.state.id,
                    peer = %self.state.peer_addr,
                    ident = %ident,
                    known = lookup.is_some(),
                    "Authentication failed"
                );
                self.framed.send(Frame::error(ERR_AUTH_FAIL)).await?;
                Ok(None)
            }
        }
    }

    async fn serve(
        &mut self,
        handle: &Arc<ConnectionHandle>,
        key: &AuthKey,
        rx: &mut mpsc::Receiver<Outbound>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(session_id = self.state.id, "Closing session for shutdown");
                    return Ok(());
                }
                outbound = rx.recv() => {
                    // The handle owns the sender, so the queue cannot close while we run
                    let Some(msg) = outbound else { return Ok(()) };
                    let size = msg.payload.len();
                    let sent = self
                        .framed
                        .send(Frame::Publish {
                            ident: msg.source,
                            channel: msg.channel,
                            payload: msg.payload,
                        })
                        .await;
                    metrics::send_buffer_drained(handle.ak(), size);
                    sent?;
                    self.state.messages_sent += 1;
                }
                inbound = self.framed.next() => {
                    let Some(frame) = inbound else { return Ok(()) };
                    self.state.frames_received += 1;
                    if let Flow::Close = self.handle_frame(handle, key, frame?).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        handle: &Arc<ConnectionHandle>,
        key: &AuthKey,
        frame: Frame,
    ) -> Result<Flow> {
        match frame {
            Frame::Publish {
                ident,
                channel,
                payload,
            } => {
                if ident != key.ident || !key.can_publish(&channel) {
                    self.deny("publish", &ident, &channel).await?;
                    return Ok(Flow::Continue);
                }
                self.registry.publish(handle, &channel, payload);
                self.state.publishes += 1;
            }
            Frame::Subscribe { ident, channel } => {
                if ident != key.ident || !key.can_subscribe(&channel) {
                    self.deny("subscribe", &ident, &channel).await?;
                    return Ok(Flow::Continue);
                }
                self.registry.subscribe(handle, &channel);
            }
            Frame::Unsubscribe { channel, .. } => {
                self.registry.unsubscribe(handle, &channel);
            }
            Frame::Error(message) => {
                tracing::warn!(
                    session_id = self.state.id,
                    ident = %key.ident,
                    message = %message,
                    "Client reported error"
                );
            }
            other @ (Frame::Info { .. } | Frame::Auth { .. }) => {
                tracing::warn!(
                    session_id = self.state.id,
                    ident = %key.ident,
                    opcode = other.opcode(),
                    "Unexpected message after authentication"
                );
                self.framed
                    .send(Frame::error("unexpected message"))
                    .await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn deny(&mut self, action: &str, ident: &str, channel: &str) -> Result<()> {
        tracing::warn!(
            session_id = self.state.id,
            ident = %ident,
            chan = %channel,
            action = action,
            "Access denied"
        );
        self.framed.send(Frame::error(ERR_ACCESS_FAIL)).await?;
        Ok(())
    }

    /// Drop every subscription this connection holds, leave the connection
    /// set, and discard whatever is still queued for the client
    fn release(&self, handle: &Arc<ConnectionHandle>, rx: &mut mpsc::Receiver<Outbound>) {
        self.registry.unsubscribe_all(handle);
        self.registry.detach(handle.id());

        rx.close();
        let mut discarded = 0;
        while let Ok(msg) = rx.try_recv() {
            metrics::send_buffer_drained(handle.ak(), msg.payload.len());
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(
                session_id = self.state.id,
                ident = handle.ak(),
                discarded = discarded,
                "Discarded undelivered messages"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::DuplexStream;
    use tokio_test::assert_ok;

    use super::*;
    use crate::auth::MemoryAuthenticator;
    use crate::stats::metrics::testing::sample;
    use crate::stats::metrics::CLIENT_SEND_BUFFER_FILL;

    struct Discard;

    impl MessageSink for Discard {
        fn deliver(&self, _: &str, _: &str, _: Bytes) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    struct Harness {
        registry: Arc<SubscriptionRegistry>,
        shutdown: CancellationToken,
        next_id: u64,
    }

    impl Harness {
        fn new() -> Self {
            let auth = MemoryAuthenticator::with_keys([
                AuthKey::new("alice", "test", "alice-secret")
                    .publish(["chan.test"])
                    .subscribe(["chan.test", "chan.other"]),
                AuthKey::new("bob", "test", "bob-secret").publish(["chan.test"]),
            ]);
            Self {
                registry: Arc::new(SubscriptionRegistry::new(Arc::new(auth))),
                shutdown: CancellationToken::new(),
                next_id: 1,
            }
        }

        /// Spawn a session over an in-memory pipe and return the client side
        fn spawn(&mut self, config: BrokerConfig) -> (Framed<DuplexStream, FrameCodec>, tokio::task::JoinHandle<Result<()>>) {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let mut connection = Connection::new(
                self.next_id,
                server,
                "127.0.0.1:40000".parse().unwrap(),
                Arc::new(config),
                self.registry.clone(),
                self.shutdown.child_token(),
            );
            self.next_id += 1;
            let task = tokio::spawn(async move { connection.run().await });
            (Framed::new(client, FrameCodec::new()), task)
        }

        async fn login(&mut self, ident: &str, secret: &str) -> (Framed<DuplexStream, FrameCodec>, tokio::task::JoinHandle<Result<()>>) {
            let (mut client, task) = self.spawn(BrokerConfig::default());
            let nonce = read_info(&mut client).await;
            client.send(Frame::auth(ident, &nonce, secret)).await.unwrap();
            (client, task)
        }

        async fn wait_until(&self, cond: impl Fn(&SubscriptionRegistry) -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !cond(&self.registry) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("condition not reached");
        }
    }

    async fn read_info(client: &mut Framed<DuplexStream, FrameCodec>) -> Bytes {
        match client.next().await {
            Some(Ok(Frame::Info { name, nonce })) => {
                assert_eq!(name, "hpfeeds");
                assert_eq!(nonce.len(), 4);
                nonce
            }
            other => panic!("expected INFO, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_wrong_secret() {
        let mut harness = Harness::new();
        let (mut client, task) = harness.login("alice", "wrong").await;

        assert_eq!(client.next().await.unwrap().unwrap(), Frame::error(ERR_AUTH_FAIL));
        assert!(client.next().await.is_none());
        assert_ok!(task.await.unwrap());
        assert_eq!(harness.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_unknown_ident() {
        let mut harness = Harness::new();
        let (mut client, task) = harness.login("mallory", "anything").await;

        assert_eq!(client.next().await.unwrap().unwrap(), Frame::error(ERR_AUTH_FAIL));
        assert_ok!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_first_message_must_be_auth() {
        let mut harness = Harness::new();
        let (mut client, task) = harness.spawn(BrokerConfig::default());
        read_info(&mut client).await;

        client.send(Frame::subscribe("alice", "chan.test")).await.unwrap();

        assert_eq!(client.next().await.unwrap().unwrap(), Frame::error(ERR_AUTH_FAIL));
        assert_ok!(task.await.unwrap());
        assert_eq!(harness.registry.subscriber_count("chan.test"), 0);
    }

    #[tokio::test]
    async fn test_auth_timeout() {
        let mut harness = Harness::new();
        let config = BrokerConfig::default().auth_timeout(Duration::from_millis(50));
        let (mut client, task) = harness.spawn(config);
        read_info(&mut client).await;

        assert!(client.next().await.is_none());
        assert_ok!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_publish_and_disconnect_cleanup() {
        let mut harness = Harness::new();
        let (mut alice, alice_task) = harness.login("alice", "alice-secret").await;
        let (mut bob, _bob_task) = harness.login("bob", "bob-secret").await;

        alice.send(Frame::subscribe("alice", "chan.test")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.test") == 1).await;

        bob.send(Frame::publish("bob", "chan.test", Bytes::from_static(b"payload")))
            .await
            .unwrap();

        let received = alice.next().await.unwrap().unwrap();
        assert_eq!(received, Frame::publish("bob", "chan.test", Bytes::from_static(b"payload")));

        drop(alice);
        assert_ok!(alice_task.await.unwrap());
        assert_eq!(harness.registry.subscriber_count("chan.test"), 0);
        assert_eq!(harness.registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscriptions_released_on_close() {
        let mut harness = Harness::new();
        let (mut alice, alice_task) = harness.login("alice", "alice-secret").await;

        alice.send(Frame::subscribe("alice", "chan.other")).await.unwrap();
        alice.send(Frame::subscribe("alice", "chan.other")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.other") == 2).await;

        drop(alice);
        assert_ok!(alice_task.await.unwrap());
        assert_eq!(harness.registry.subscriber_count("chan.other"), 0);
    }

    #[tokio::test]
    async fn test_partial_unsubscribe_of_duplicate_released_on_close() {
        let mut harness = Harness::new();
        let (mut alice, alice_task) = harness.login("alice", "alice-secret").await;

        alice.send(Frame::subscribe("alice", "chan.other")).await.unwrap();
        alice.send(Frame::subscribe("alice", "chan.other")).await.unwrap();
        alice.send(Frame::unsubscribe("alice", "chan.other")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.other") == 1).await;

        drop(alice);
        assert_ok!(alice_task.await.unwrap());
        assert_eq!(harness.registry.connection_count(), 0);
        assert_eq!(harness.registry.subscriber_count("chan.other"), 0);
        assert!(harness.registry.subscribers("chan.other").is_empty());
    }

    #[tokio::test]
    async fn test_queued_messages_leave_buffer_gauge_on_close() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let rendered = recorder.handle();
        let _recorder = ::metrics::set_default_local_recorder(&recorder);

        let mut harness = Harness::new();
        let (mut alice, alice_task) = harness.login("alice", "alice-secret").await;
        alice.send(Frame::subscribe("alice", "chan.test")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.test") == 1).await;

        // Published without yielding, so everything is still queued when alice leaves
        let bob = ConnectionHandle::new(99, "bob", Discard);
        for _ in 0..200 {
            harness
                .registry
                .publish(&bob, "chan.test", Bytes::from(vec![0u8; 4096]));
        }
        let fill = || sample(&rendered.render(), CLIENT_SEND_BUFFER_FILL, &[("ident", "alice")]);
        assert_eq!(fill(), Some(200.0 * 4096.0));

        drop(alice);
        let _ = alice_task.await.unwrap();

        assert_eq!(fill(), Some(0.0));
    }

    #[tokio::test]
    async fn test_access_denied() {
        let mut harness = Harness::new();
        let (mut bob, _task) = harness.login("bob", "bob-secret").await;

        // bob has no subscribe rights
        bob.send(Frame::subscribe("bob", "chan.test")).await.unwrap();
        assert_eq!(bob.next().await.unwrap().unwrap(), Frame::error(ERR_ACCESS_FAIL));

        // publishing under someone else's identity
        bob.send(Frame::publish("alice", "chan.test", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(bob.next().await.unwrap().unwrap(), Frame::error(ERR_ACCESS_FAIL));

        // channel outside pubchans
        bob.send(Frame::publish("bob", "chan.other", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(bob.next().await.unwrap().unwrap(), Frame::error(ERR_ACCESS_FAIL));

        assert_eq!(harness.registry.subscriber_count("chan.test"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mut harness = Harness::new();
        let (mut alice, _alice_task) = harness.login("alice", "alice-secret").await;

        alice.send(Frame::subscribe("alice", "chan.test")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.test") == 1).await;
        alice.send(Frame::unsubscribe("alice", "chan.test")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.test") == 0).await;

        // alice publishes to her own former channel; nothing comes back
        alice.send(Frame::publish("alice", "chan.test", Bytes::from_static(b"x")))
            .await
            .unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), alice.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let mut harness = Harness::new();
        let (mut alice, task) = harness.login("alice", "alice-secret").await;
        alice.send(Frame::subscribe("alice", "chan.test")).await.unwrap();
        harness.wait_until(|r| r.subscriber_count("chan.test") == 1).await;

        harness.shutdown.cancel();

        assert_ok!(task.await.unwrap());
        assert!(alice.next().await.is_none());
        assert_eq!(harness.registry.subscriber_count("chan.test"), 0);
        assert_eq!(harness.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_full_drops_message() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = QueueSink {
            ak: "alice".into(),
            tx,
        };

        assert_eq!(sink.deliver("bob", "c", Bytes::from_static(b"1")), Ok(()));
        assert_eq!(
            sink.deliver("bob", "c", Bytes::from_static(b"2")),
            Err(DeliveryError::QueueFull)
        );

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.payload, Bytes::from_static(b"1"));

        drop(rx);
        assert_eq!(
            sink.deliver("bob", "c", Bytes::from_static(b"3")),
            Err(DeliveryError::Closed)
        );
    }
}
