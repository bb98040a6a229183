//! Per-connection lifecycle.
//!
//! A [`ConnectionSession`] is a tagged state plus the data bound to one
//! socket. Feeding it a [`SessionEvent`] returns the [`Effect`]s the caller
//! must carry out; the session itself never touches I/O, so every path
//! through the one-shot exchange can be driven without sockets.
//!
//! ```text
//! AwaitingGreeting -> NegotiatingProtocol -> AwaitingPayload -> Decoding -> Completed
//!                                  \               \               \
//!                                   +---------------+---------------+--> Failed
//! ```

use crate::config::V2_MAGIC;
use crate::core::codec::LENGTH_PREFIX_LEN;
use crate::core::vote::Vote;
use crate::error::DecodeError;
use crate::protocol::handshake::{greeting_line, Challenge};
use crate::protocol::{Decoded, ProtocolVersion};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingGreeting,
    NegotiatingProtocol,
    AwaitingPayload(ProtocolVersion),
    /// Frame handed to the decoder; waiting for its verdict
    Decoding(ProtocolVersion),
    Completed,
    Failed(DecodeError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Socket accepted and handed to this session
    Accepted,
    Negotiated(ProtocolVersion),
    FrameReceived(Bytes),
    Decoded(Result<Decoded, DecodeError>),
    /// Framing rejected the input (oversized or unusable frame)
    FrameRejected(DecodeError),
    /// Peer closed before a complete frame arrived
    PeerClosed,
    TimedOut,
}

/// Work requested by the state machine, carried out in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SendGreeting(String),
    Decode {
        protocol: ProtocolVersion,
        frame: Bytes,
        challenge: Option<String>,
    },
    Dispatch(Vote),
    /// V2 success reply
    Acknowledge,
    /// Record a failure kind (including non-fatal warnings)
    Report(DecodeError),
    /// The connection's challenge is now spent
    RetireChallenge(Challenge),
    Close,
}

/// Transient state for one TCP connection
#[derive(Debug)]
pub struct ConnectionSession {
    remote: SocketAddr,
    established_at: Instant,
    state: SessionState,
    protocol: Option<ProtocolVersion>,
    bytes_received_since_greeting: usize,
    challenge: Option<Challenge>,
    v1_enabled: bool,
}

impl ConnectionSession {
    /// `challenge` is present exactly when the listener accepts V2.
    pub fn new(remote: SocketAddr, challenge: Option<Challenge>, v1_enabled: bool) -> Self {
        Self {
            remote,
            established_at: Instant::now(),
            state: SessionState::AwaitingGreeting,
            protocol: None,
            bytes_received_since_greeting: 0,
            challenge,
            v1_enabled,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Protocol chosen by the peer, once known
    pub fn protocol(&self) -> Option<ProtocolVersion> {
        self.protocol
    }

    /// Wire bytes of the vote frame, V2 magic and length prefix included
    pub fn bytes_received_since_greeting(&self) -> usize {
        self.bytes_received_since_greeting
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Advance the state machine. Events after a terminal state are ignored.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let (next, mut effects) = self.transition(event);
        self.state = next;

        if next.is_terminal() {
            if let Some(challenge) = self.challenge.take() {
                effects.push(Effect::RetireChallenge(challenge));
            }
            effects.push(Effect::Close);
        }
        effects
    }

    fn transition(&mut self, event: SessionEvent) -> (SessionState, Vec<Effect>) {
        use SessionEvent as E;
        use SessionState as S;

        match (self.state, event) {
            (S::AwaitingGreeting, E::Accepted) => (
                S::NegotiatingProtocol,
                vec![Effect::SendGreeting(greeting_line(self.challenge.as_ref()))],
            ),

            (S::NegotiatingProtocol, E::Negotiated(version)) => {
                self.protocol = Some(version);
                if self.accepts(version) {
                    (S::AwaitingPayload(version), Vec::new())
                } else {
                    fail(DecodeError::UnknownOpcode)
                }
            }

            (S::AwaitingPayload(protocol), E::FrameReceived(frame)) => {
                let (framing, challenge) = match protocol {
                    ProtocolVersion::V2 => (
                        V2_MAGIC.len() + LENGTH_PREFIX_LEN,
                        self.challenge.as_ref().map(|c| c.as_str().to_string()),
                    ),
                    ProtocolVersion::V1 => (0, None),
                };
                self.bytes_received_since_greeting += framing + frame.len();
                (
                    S::Decoding(protocol),
                    vec![Effect::Decode {
                        protocol,
                        frame,
                        challenge,
                    }],
                )
            }

            (S::Decoding(protocol), E::Decoded(Ok(decoded))) => {
                let mut effects = Vec::with_capacity(3);
                if let Some(warning) = decoded.warning {
                    effects.push(Effect::Report(warning));
                }
                effects.push(Effect::Dispatch(decoded.vote));
                if protocol == ProtocolVersion::V2 {
                    effects.push(Effect::Acknowledge);
                }
                (S::Completed, effects)
            }

            (S::Decoding(_), E::Decoded(Err(kind))) => fail(kind),

            (_, E::FrameRejected(kind)) => fail(kind),
            (_, E::TimedOut) => fail(DecodeError::Timeout),
            (_, E::PeerClosed) => fail(DecodeError::MalformedPayload),

            // Anything else is out of order for a one-shot exchange.
            _ => fail(DecodeError::MalformedPayload),
        }
    }

    fn accepts(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::V1 => self.v1_enabled,
            ProtocolVersion::V2 => self.challenge.is_some(),
        }
    }
}

fn fail(kind: DecodeError) -> (SessionState, Vec<Effect>) {
    (SessionState::Failed(kind), vec![Effect::Report(kind)])
}
