//! Resilient connection: stall detection and debounced reconnection.
//!
//! Wraps a single request/response framing that carries JSON envelopes
//! (not mux frames) and keeps it alive across silent stalls and carrier
//! failures:
//!
//! - **Failure-deadline timer** (default 60 s): armed via
//!   [`ResilientConnection::expecting_data`] when the caller awaits a
//!   reply; disarmed on every incoming message. Firing triggers a
//!   reconnect.
//! - **Reconnect timer**: after tearing down the carrier, sleeps
//!   `base + U(0, jitter)` ms (defaults 500 + U(0, 1000)) before
//!   reconnecting. Close and error racing each other produce a single
//!   attempt.
//!
//! On every (re)connect the JSON auth envelope is sent first, then a
//! [`ResilientEvent::Reconnected`] is emitted so the owner can re-issue
//! its subscriptions and replay anything sent into the gap, since
//! [`write`](ResilientConnection::write) drops silently while no carrier
//! is attached.
//!
//! Timers are owned handles whose drop aborts the underlying sleep;
//! reassignment replaces (cancels and re-arms) atomically, so at most one
//! of each timer is ever alive.

use crate::auth::{build_auth_request, Credentials};
use crate::config::ResilienceConfig;
use crate::envelope::{Request, Response};
use crate::error::Result;
use crate::metrics;
use crate::transport::{Transport, TransportEvent, TransportSender};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Factory producing a fresh carrier for each (re)connect attempt.
pub type Connector =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Transport>> + Send>> + Send + Sync>;

/// Events emitted by a resilient connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilientEvent {
    /// A decoded response envelope from the server.
    Message(Response),
    /// A reconnect completed; the owner should re-issue subscriptions and
    /// replay local diffs since its persisted watermark.
    Reconnected,
}

/// Supervisor commands, from the public handle, timers, and forwarders.
enum Cmd {
    Write(Request),
    ExpectingData,
    /// Carrier traffic tagged with the generation it belongs to; stale
    /// generations are ignored after a teardown.
    Transport(u64, TransportEvent),
    Stall(u64),
    Reconnect,
    Shutdown,
}

/// Owned timer: dropping the handle cancels the pending fire.
struct TimerHandle(JoinHandle<()>);

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn arm_timer(delay: Duration, cmd_tx: mpsc::UnboundedSender<Cmd>, cmd: Cmd) -> TimerHandle {
    TimerHandle(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = cmd_tx.send(cmd);
    }))
}

/// A self-healing JSON-envelope connection.
///
/// Used by the legacy one-shot replication path; the mux path carries its
/// own resubscription hook instead.
pub struct ResilientConnection {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl ResilientConnection {
    /// Connect over a WebSocket carrier.
    ///
    /// The initial connect failure is returned synchronously; later
    /// failures are retried with backoff forever.
    pub async fn connect(
        uri: &str,
        creds: Credentials,
        config: ResilienceConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ResilientEvent>)> {
        let uri = uri.to_string();
        let connector: Connector = Arc::new(move || {
            let uri = uri.clone();
            Box::pin(async move { Transport::connect(&uri).await })
        });
        Self::connect_with(connector, creds, config).await
    }

    /// Connect through a caller-supplied carrier factory.
    pub async fn connect_with(
        connector: Connector,
        creds: Credentials,
        config: ResilienceConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ResilientEvent>)> {
        let transport = connector().await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor {
            connector,
            creds,
            config,
            cmd_tx: cmd_tx.clone(),
            events: event_tx,
            carrier: None,
            forwarder: None,
            failure_timer: None,
            reconnect_timer: None,
            generation: 0,
        };
        supervisor.attach(transport)?;
        tokio::spawn(supervisor.run(cmd_rx));

        Ok((Self { cmd_tx }, event_rx))
    }

    /// Send a request envelope.
    ///
    /// Silently dropped while no carrier is attached; the re-subscribe on
    /// reconnect must close the gap.
    pub fn write(&self, request: Request) {
        let _ = self.cmd_tx.send(Cmd::Write(request));
    }

    /// Declare that a reply is expected: arms the failure-deadline timer.
    pub fn expecting_data(&self) {
        let _ = self.cmd_tx.send(Cmd::ExpectingData);
    }

    /// Tear down the connection and stop reconnecting.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
    }
}

struct Supervisor {
    connector: Connector,
    creds: Credentials,
    config: ResilienceConfig,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    events: mpsc::UnboundedSender<ResilientEvent>,
    carrier: Option<TransportSender>,
    forwarder: Option<JoinHandle<()>>,
    failure_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    generation: u64,
}

impl Supervisor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Write(request) => self.handle_write(request),
                Cmd::ExpectingData => self.handle_expecting_data(),
                Cmd::Transport(generation, event) => {
                    if generation == self.generation {
                        self.handle_transport_event(event);
                    }
                }
                Cmd::Stall(generation) => {
                    if generation == self.generation {
                        debug!("expected data did not arrive, treating as stall");
                        metrics::record_stall();
                        self.schedule_reconnect("stall");
                    }
                }
                Cmd::Reconnect => self.handle_reconnect().await,
                Cmd::Shutdown => break,
            }
        }
        self.detach();
    }

    /// Install a fresh carrier and authenticate on it.
    fn attach(&mut self, transport: Transport) -> Result<()> {
        let (sender, mut events) = transport.split();

        let auth = build_auth_request(&self.creds)?;
        sender.send(serde_json::to_vec(&auth)?)?;

        let generation = self.generation;
        let cmd_tx = self.cmd_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if cmd_tx.send(Cmd::Transport(generation, event)).is_err() {
                    break;
                }
            }
        }));
        self.carrier = Some(sender);
        Ok(())
    }

    /// Detach all handlers and drop the carrier.
    fn detach(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(carrier) = self.carrier.take() {
            carrier.close(crate::transport::CLOSE_NORMAL);
        }
        self.failure_timer.take();
        self.generation += 1;
    }

    fn handle_write(&mut self, request: Request) {
        let Some(carrier) = &self.carrier else {
            trace!("no carrier, dropping write");
            return;
        };
        match serde_json::to_vec(&request) {
            Ok(bytes) => {
                // A failed send surfaces as a close event from the
                // forwarder; the write itself is fire-and-forget.
                let _ = carrier.send(bytes);
            }
            Err(e) => warn!(error = %e, "failed to encode request envelope"),
        }
    }

    fn handle_expecting_data(&mut self) {
        if self.carrier.is_none() {
            return; // reconnect already pending, it will re-subscribe
        }
        self.failure_timer = Some(arm_timer(
            self.config.failure_timeout(),
            self.cmd_tx.clone(),
            Cmd::Stall(self.generation),
        ));
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(bytes) => {
                // Any inbound message proves the connection is alive.
                self.failure_timer.take();
                match serde_json::from_slice::<Response>(&bytes) {
                    Ok(response) => {
                        let _ = self.events.send(ResilientEvent::Message(response));
                    }
                    Err(e) => warn!(error = %e, "undecodable response envelope, skipping"),
                }
            }
            TransportEvent::Closed { code, .. } => {
                debug!(code, "carrier closed");
                self.schedule_reconnect("closed");
            }
            TransportEvent::Error(msg) => {
                warn!(error = %msg, "carrier error");
                self.schedule_reconnect("error");
            }
        }
    }

    fn schedule_reconnect(&mut self, reason: &str) {
        if self.reconnect_timer.is_some() {
            return; // debounced: one attempt at a time
        }
        self.detach();

        let jitter = rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms);
        let delay = Duration::from_millis(self.config.backoff_base_ms + jitter);
        info!(reason, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        metrics::record_reconnect(reason);

        self.reconnect_timer = Some(arm_timer(delay, self.cmd_tx.clone(), Cmd::Reconnect));
    }

    async fn handle_reconnect(&mut self) {
        self.reconnect_timer.take();
        match (self.connector)().await {
            Ok(transport) => match self.attach(transport) {
                Ok(()) => {
                    info!("reconnected");
                    let _ = self.events.send(ResilientEvent::Reconnected);
                }
                Err(e) => {
                    warn!(error = %e, "failed to authenticate after reconnect");
                    self.schedule_reconnect("auth_failed");
                }
            },
            Err(e) => {
                warn!(error = %e, "reconnect attempt failed");
                self.schedule_reconnect("connect_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn test_creds() -> Credentials {
        Credentials::new("ABCDEFGHIJKLMNOPQRST", b"resilience-key".to_vec(), "dev")
    }

    /// Connector that hands the server half of each pair to the test.
    fn pair_connector() -> (Connector, mpsc::UnboundedReceiver<Transport>) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let connector: Connector = Arc::new(move || {
            let server_tx = server_tx.clone();
            Box::pin(async move {
                let (client, server) = Transport::pair();
                let _ = server_tx.send(server);
                Ok(client)
            })
        });
        (connector, server_rx)
    }

    async fn expect_auth(server: &mut Transport) {
        match server.recv().await {
            Some(TransportEvent::Message(bytes)) => {
                let req: Request = serde_json::from_slice(&bytes).unwrap();
                assert!(matches!(req, Request::Auth { .. }));
            }
            other => panic!("expected auth envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_sends_auth_envelope() {
        let (connector, mut servers) = pair_connector();
        let (_conn, _events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server = servers.recv().await.unwrap();
        expect_auth(&mut server).await;
    }

    #[tokio::test]
    async fn test_write_reaches_server() {
        let (connector, mut servers) = pair_connector();
        let (conn, _events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server = servers.recv().await.unwrap();
        expect_auth(&mut server).await;

        conn.write(Request::Tail {
            table: "todos".to_string(),
            since: 3,
        });

        match server.recv().await {
            Some(TransportEvent::Message(bytes)) => {
                let req: Request = serde_json::from_slice(&bytes).unwrap();
                assert_eq!(
                    req,
                    Request::Tail {
                        table: "todos".to_string(),
                        since: 3
                    }
                );
            }
            other => panic!("expected tail envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incoming_message_surfaces_as_event() {
        let (connector, mut servers) = pair_connector();
        let (_conn, mut events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server = servers.recv().await.unwrap();
        expect_auth(&mut server).await;

        let response = Response::Pipe {
            data: "1,\"milk\"\n".to_string(),
        };
        server.send(serde_json::to_vec(&response).unwrap()).unwrap();

        assert_eq!(
            events.recv().await,
            Some(ResilientEvent::Message(response))
        );
    }

    #[tokio::test]
    async fn test_stall_triggers_reconnect() {
        let (connector, mut servers) = pair_connector();
        let (conn, mut events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server1 = servers.recv().await.unwrap();
        expect_auth(&mut server1).await;

        // Expect a reply that never arrives. The failure deadline (100ms in
        // the testing preset) fires, the socket is torn down, and after the
        // backoff a fresh carrier appears with a fresh auth envelope.
        conn.expecting_data();

        let mut server2 = timeout(Duration::from_secs(2), servers.recv())
            .await
            .expect("reconnect within deadline")
            .unwrap();
        expect_auth(&mut server2).await;

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("reconnected event")
            .unwrap();
        assert_eq!(event, ResilientEvent::Reconnected);
    }

    #[tokio::test]
    async fn test_message_disarms_failure_deadline() {
        let (connector, mut servers) = pair_connector();
        let (conn, mut events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server = servers.recv().await.unwrap();
        expect_auth(&mut server).await;

        conn.expecting_data();
        server
            .send(serde_json::to_vec(&Response::Pipe { data: "ok".into() }).unwrap())
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ResilientEvent::Message(_))
        ));

        // The deadline was disarmed: no second carrier within the window.
        assert!(
            timeout(Duration::from_millis(300), servers.recv())
                .await
                .is_err(),
            "unexpected reconnect after activity"
        );
    }

    #[tokio::test]
    async fn test_close_triggers_single_reconnect() {
        let (connector, mut servers) = pair_connector();
        let (_conn, mut events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server1 = servers.recv().await.unwrap();
        expect_auth(&mut server1).await;

        drop(server1); // carrier close

        let mut server2 = timeout(Duration::from_secs(2), servers.recv())
            .await
            .expect("reconnect within deadline")
            .unwrap();
        expect_auth(&mut server2).await;
        assert_eq!(events.recv().await, Some(ResilientEvent::Reconnected));

        // Debounced: exactly one reconnect for the one failure.
        assert!(
            timeout(Duration::from_millis(300), servers.recv())
                .await
                .is_err(),
            "second reconnect without a second failure"
        );
    }

    #[tokio::test]
    async fn test_write_while_disconnected_drops_silently() {
        let (connector, mut servers) = pair_connector();
        let (conn, _events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server1 = servers.recv().await.unwrap();
        expect_auth(&mut server1).await;
        drop(server1);

        // Carrier is down; the write must not error or panic.
        conn.write(Request::Pipe {
            data: "lost".to_string(),
        });

        // The replacement carrier sees only the fresh auth envelope.
        let mut server2 = timeout(Duration::from_secs(2), servers.recv())
            .await
            .expect("reconnect")
            .unwrap();
        expect_auth(&mut server2).await;
        assert!(
            timeout(Duration::from_millis(200), server2.recv())
                .await
                .is_err(),
            "dropped write leaked through"
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnecting() {
        let (connector, mut servers) = pair_connector();
        let (conn, _events) =
            ResilientConnection::connect_with(connector, test_creds(), ResilienceConfig::for_testing())
                .await
                .unwrap();
        let mut server1 = servers.recv().await.unwrap();
        expect_auth(&mut server1).await;

        conn.shutdown();
        drop(server1);

        assert!(
            timeout(Duration::from_millis(300), servers.recv())
                .await
                .is_err(),
            "reconnect after shutdown"
        );
    }
}
