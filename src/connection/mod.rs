pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::handler::HandlerRegistry;

/// Minimum spacing between WebSocket connection attempts.
const RECONNECT_WINDOW: Duration = Duration::from_secs(5);

/// Bounded event queue; transports block briefly rather than flooding the
/// state machine.
const EVENT_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    WsConnected,
    SshConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    WebSocketConnect,
    WebSocketDisconnect,
    SshConnect,
    SshDisconnect,
}

/// The transition table. A disconnect for a transport that isn't the active
/// one is ignored; an SSH session always wins over an active WebSocket.
pub(crate) fn transition(state: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent::*;
    use ConnectionState::*;
    match (state, event) {
        (Disconnected, WebSocketConnect) => WsConnected,
        (Disconnected, SshConnect) => SshConnected,
        (WsConnected, WebSocketDisconnect) => Disconnected,
        (WsConnected, SshConnect) => SshConnected,
        (SshConnected, SshDisconnect) => Disconnected,
        (SshConnected, WebSocketDisconnect) => SshConnected,
        (WsConnected, SshDisconnect) => WsConnected,
        // A late-completing WebSocket connect takes over from SSH; the hub
        // prefers its outbound session.
        (SshConnected, WebSocketConnect) => WsConnected,
        (state, _) => state,
    }
}

/// Owns the connection state and arbitrates between the two transports.
///
/// The state variable is only ever written by the event loop in `run`;
/// transports communicate exclusively by emitting events. Reconnection
/// bookkeeping (`is_connecting`, the rate-limit clock, the per-session hub
/// version cache on the SSH side) are instance fields so tests can build
/// fresh managers.
pub struct ConnectionManager {
    agent: Arc<Agent>,
    ws_registry: Arc<HandlerRegistry>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    is_connecting: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    ws_session_cancel: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(agent: Arc<Agent>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            agent,
            ws_registry: Arc::new(HandlerRegistry::new(true)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state_tx,
            state_rx,
            is_connecting: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            ws_session_cancel: Mutex::new(None),
        })
    }

    /// Sender side of the event channel, handed to the transports.
    pub fn event_sink(&self) -> mpsc::Sender<ConnectionEvent> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// The state-machine event loop. Call once; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut events_rx) = self.events_rx.lock().await.take() else {
            debug!("Event loop already running — ignoring second run call");
            return;
        };

        // Initial outbound attempt.
        self.schedule_reconnect(cancel.clone()).await;

        let mut state = ConnectionState::Disconnected;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let next = transition(state, event);
            debug!(?state, ?event, ?next, "Connection event");

            if state == ConnectionState::WsConnected && next == ConnectionState::SshConnected {
                // SSH preempts the WebSocket session explicitly.
                self.close_ws_session().await;
            }
            if next == ConnectionState::WsConnected {
                self.is_connecting.store(false, Ordering::Release);
            }
            if next == ConnectionState::Disconnected {
                info!(?event, "Disconnected from hub — scheduling reconnect");
                self.schedule_reconnect(cancel.clone()).await;
            }

            if next != state {
                state = next;
                let _ = self.state_tx.send(state);
            }
        }

        self.close_ws_session().await;
    }

    /// Start one rate-limited WebSocket attempt unless one is in flight.
    /// Failure emits `WebSocketDisconnect`, which re-enters `Disconnected`
    /// and schedules the next attempt.
    async fn schedule_reconnect(self: &Arc<Self>, cancel: CancellationToken) {
        let Some(settings) = ws::WsSettings::from_config(self.agent.config()) else {
            return;
        };
        if self.is_connecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let delay = {
            let last = self.last_attempt.lock().await;
            last.map(|t| RECONNECT_WINDOW.saturating_sub(t.elapsed()))
                .unwrap_or(Duration::ZERO)
        };

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            *manager.last_attempt.lock().await = Some(Instant::now());

            let session_cancel = cancel.child_token();
            *manager.ws_session_cancel.lock().await = Some(session_cancel.clone());

            let result = ws::run_session(
                manager.agent.clone(),
                manager.ws_registry.clone(),
                manager.events_tx.clone(),
                session_cancel,
                settings,
            )
            .await;

            manager.is_connecting.store(false, Ordering::Release);
            if let Err(e) = result {
                debug!(error = %e, "WebSocket session ended with error");
            }
            // Both connect failure and session close land here; the event
            // loop decides whether it matters for the current state.
            let _ = manager
                .events_tx
                .send(ConnectionEvent::WebSocketDisconnect)
                .await;
        });
    }

    async fn close_ws_session(&self) {
        if let Some(cancel) = self.ws_session_cancel.lock().await.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;
    use ConnectionState::*;

    // -----------------------------------------------------------------------
    // transition table, every cell
    // -----------------------------------------------------------------------

    #[test]
    fn disconnected_transitions() {
        assert_eq!(transition(Disconnected, WebSocketConnect), WsConnected);
        assert_eq!(transition(Disconnected, SshConnect), SshConnected);
        assert_eq!(transition(Disconnected, WebSocketDisconnect), Disconnected);
        assert_eq!(transition(Disconnected, SshDisconnect), Disconnected);
    }

    #[test]
    fn ws_connected_transitions() {
        assert_eq!(transition(WsConnected, WebSocketDisconnect), Disconnected);
        assert_eq!(transition(WsConnected, SshConnect), SshConnected);
        assert_eq!(transition(WsConnected, SshDisconnect), WsConnected);
        assert_eq!(transition(WsConnected, WebSocketConnect), WsConnected);
    }

    #[test]
    fn ssh_connected_transitions() {
        assert_eq!(transition(SshConnected, SshDisconnect), Disconnected);
        assert_eq!(transition(SshConnected, WebSocketDisconnect), SshConnected);
        assert_eq!(transition(SshConnected, SshConnect), SshConnected);
        assert_eq!(transition(SshConnected, WebSocketConnect), WsConnected);
    }

    // -----------------------------------------------------------------------
    // event loop behavior
    // -----------------------------------------------------------------------

    async fn test_manager() -> Arc<ConnectionManager> {
        use crate::config::{base_config, AgentConfig};
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: Some(dir.path().to_string_lossy().into_owned()),
            skip_gpu: true,
            // No hub_url: the manager runs without outbound attempts.
            ..base_config()
        };
        std::mem::forget(dir);
        let agent = Arc::new(
            Agent::new(config, CancellationToken::new())
                .await
                .unwrap(),
        );
        ConnectionManager::new(agent)
    }

    #[tokio::test]
    async fn ssh_session_drives_state() {
        let manager = test_manager().await;
        let cancel = CancellationToken::new();
        let sink = manager.event_sink();
        let handle = tokio::spawn(manager.clone().run(cancel.clone()));

        sink.send(SshConnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), SshConnected);

        sink.send(SshDisconnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), Disconnected);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stale_ws_disconnect_ignored_during_ssh() {
        let manager = test_manager().await;
        let cancel = CancellationToken::new();
        let sink = manager.event_sink();
        let handle = tokio::spawn(manager.clone().run(cancel.clone()));

        sink.send(WebSocketConnect).await.unwrap();
        sink.send(SshConnect).await.unwrap();
        // The preempted WS session's close event must not disturb SSH.
        sink.send(WebSocketDisconnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), SshConnected);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ws_disconnect_sets_connecting_flag() {
        let manager = test_manager().await;
        let cancel = CancellationToken::new();
        let sink = manager.event_sink();
        let handle = tokio::spawn(manager.clone().run(cancel.clone()));

        sink.send(WebSocketConnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), WsConnected);
        assert!(!manager.is_connecting.load(Ordering::Acquire));

        sink.send(WebSocketDisconnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), Disconnected);
        // No hub_url is configured, so no attempt spawns and the flag stays
        // clear — with a hub it would be set by schedule_reconnect.

        cancel.cancel();
        handle.await.unwrap();
    }
}
