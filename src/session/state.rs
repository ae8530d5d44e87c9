//! Session state machine
//!
//! Tracks one client connection from accept to close.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// TCP connected, INFO not yet sent
    Connected,
    /// INFO sent, waiting for AUTH
    Authenticating,
    /// Authenticated and attached to the registry
    Active,
    /// Session is closing
    Closing,
    /// Session closed
    Closed,
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session ID
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Time when authentication succeeded
    pub authenticated_at: Option<Instant>,

    /// Authenticated identity
    pub ident: Option<String>,

    /// Frames received from the client
    pub frames_received: u64,

    /// Publishes accepted from the client
    pub publishes: u64,

    /// Messages written to the client
    pub messages_sent: u64,
}

impl SessionState {
    /// Create a new session state
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Connected,
            connected_at: Instant::now(),
            authenticated_at: None,
            ident: None,
            frames_received: 0,
            publishes: 0,
            messages_sent: 0,
        }
    }

    /// Transition to authenticating phase
    pub fn start_auth(&mut self) {
        if self.phase == SessionPhase::Connected {
            self.phase = SessionPhase::Authenticating;
        }
    }

    /// Complete authentication as `ident`
    pub fn on_authenticated(&mut self, ident: &str) {
        if self.phase == SessionPhase::Authenticating {
            self.phase = SessionPhase::Active;
            self.ident = Some(ident.to_owned());
            self.authenticated_at = Some(Instant::now());
        }
    }

    /// Time from accept to successful authentication
    pub fn auth_latency(&self) -> Option<Duration> {
        self.authenticated_at
            .map(|at| at.duration_since(self.connected_at))
    }

    /// Start closing the session
    pub fn close(&mut self) {
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closing;
        }
    }

    /// Mark the session closed
    pub fn closed(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
