//! Socket driver for one [`ConnectionSession`].
//!
//! Reads frames through [`VoteFrameCodec`], feeds events to the session and
//! carries out the effects it returns. Decoding runs on the blocking pool so
//! RSA work never stalls the runtime that accepts connections.

use crate::config::ServerConfig;
use crate::core::codec::{Inbound, Outbound, VoteFrameCodec};
use crate::error::{DecodeError, ProtocolError};
use crate::protocol::dispatcher::VoteSink;
use crate::protocol::handshake::ChallengeIssuer;
use crate::protocol::session::{ConnectionSession, Effect, SessionEvent};
use crate::protocol::Decoded;
use crate::utils::keys::{KeyMaterial, RsaKeyPair};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::rate_limit::{Admission, RateLimitState};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

/// State shared by a listener and all of its handlers.
pub(crate) struct ListenerContext {
    pub keys: Arc<KeyMaterial>,
    pub config: ServerConfig,
    pub rate_limits: Mutex<RateLimitState>,
    pub challenges: ChallengeIssuer,
    pub metrics: Arc<Metrics>,
    pub sink: Arc<dyn VoteSink>,
}

impl ListenerContext {
    pub fn v1_enabled(&self) -> bool {
        !self.config.disable_v1 && self.keys.supports_v1()
    }

    pub fn v2_enabled(&self) -> bool {
        self.keys.supports_v2()
    }

    /// Rate-limit admission for a freshly accepted socket.
    pub fn admit(&self, addr: IpAddr) -> Admission {
        match self.rate_limits.lock() {
            Ok(mut limits) => limits.check_connection(addr),
            // A poisoned table must not take the listener down.
            Err(poisoned) => poisoned.into_inner().check_connection(addr),
        }
    }

    fn record_vote(&self, addr: IpAddr) {
        match self.rate_limits.lock() {
            Ok(mut limits) => limits.record_vote(addr),
            Err(poisoned) => poisoned.into_inner().record_vote(addr),
        }
    }
}

/// Decrements the active-connection gauge however the handler exits.
struct ActiveGuard(Arc<Metrics>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

enum Wake {
    Deadline,
    Decoded(Result<Result<Decoded, DecodeError>, JoinError>),
    Inbound(Option<Result<Inbound, ProtocolError>>),
}

/// Run one vote exchange to completion. Never returns an error: every
/// failure is reported to the metrics/log sink and ends only this socket.
#[instrument(skip_all, fields(%peer))]
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ListenerContext>,
) {
    ctx.metrics.connection_established();
    let _active = ActiveGuard(ctx.metrics.clone());
    let deadline = Instant::now() + ctx.config.connection_timeout;

    let challenge = if ctx.v2_enabled() {
        match ctx.challenges.issue() {
            Ok(challenge) => Some(challenge),
            Err(e) => {
                warn!(error = %e, "Could not issue a challenge; closing");
                return;
            }
        }
    } else {
        None
    };

    let block_size = if ctx.v1_enabled() {
        ctx.keys.rsa().map(RsaKeyPair::block_size)
    } else {
        None
    };
    let codec =
        VoteFrameCodec::new(block_size, ctx.config.max_frame_size).with_v2(ctx.v2_enabled());
    let mut framed = Framed::new(stream, codec);
    let mut session = ConnectionSession::new(peer, challenge, ctx.v1_enabled());
    let mut decoding: Option<JoinHandle<Result<Decoded, DecodeError>>> = None;
    let mut pending: VecDeque<Effect> = session.handle(SessionEvent::Accepted).into();

    loop {
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::SendGreeting(line) => {
                    if let Err(e) = framed.send(Outbound::Greeting(line)).await {
                        debug!(error = %e, "Greeting not delivered");
                        pending.extend(session.handle(SessionEvent::PeerClosed));
                    }
                }
                Effect::Decode {
                    protocol,
                    frame,
                    challenge,
                } => {
                    let keys = ctx.keys.clone();
                    decoding = Some(tokio::task::spawn_blocking(move || {
                        let _timer = Timer::start("vote_decode");
                        protocol.decode(&frame, &keys, challenge.as_deref())
                    }));
                }
                Effect::Dispatch(vote) => {
                    ctx.record_vote(peer.ip());
                    ctx.metrics.vote_received();
                    info!(
                        protocol = ?session.protocol(),
                        service = vote.service_name(),
                        username = vote.username(),
                        address = vote.address(),
                        "Vote received"
                    );
                    ctx.sink.publish(vote);
                }
                Effect::Acknowledge => {
                    if let Err(e) = framed.send(Outbound::Acknowledge).await {
                        debug!(error = %e, "Acknowledgement not delivered");
                    }
                }
                Effect::Report(kind) => report(&ctx.metrics, &session, kind),
                Effect::RetireChallenge(challenge) => ctx.challenges.retire(&challenge),
                Effect::Close => {
                    if let Some(task) = decoding.take() {
                        task.abort();
                    }
                    let _ = framed.close().await;
                }
            }
        }

        if session.is_terminal() {
            break;
        }

        let wake = tokio::select! {
            _ = sleep_until(deadline) => Wake::Deadline,
            joined = join_decode(&mut decoding), if decoding.is_some() => Wake::Decoded(joined),
            item = framed.next(), if decoding.is_none() => Wake::Inbound(item),
        };

        let event = match wake {
            Wake::Deadline => SessionEvent::TimedOut,
            Wake::Decoded(joined) => {
                decoding = None;
                match joined {
                    Ok(result) => SessionEvent::Decoded(result),
                    Err(e) => {
                        warn!(error = %e, "Decode task failed");
                        SessionEvent::Decoded(Err(DecodeError::MalformedPayload))
                    }
                }
            }
            Wake::Inbound(Some(Ok(Inbound::Negotiated(version)))) => {
                SessionEvent::Negotiated(version)
            }
            Wake::Inbound(Some(Ok(Inbound::Frame(frame)))) => {
                ctx.metrics.bytes_read(frame.len() as u64);
                SessionEvent::FrameReceived(frame)
            }
            Wake::Inbound(Some(Err(ProtocolError::Decode(kind)))) => {
                SessionEvent::FrameRejected(kind)
            }
            Wake::Inbound(Some(Err(e))) => {
                debug!(error = %e, "Read failed");
                SessionEvent::PeerClosed
            }
            Wake::Inbound(None) => SessionEvent::PeerClosed,
        };
        pending.extend(session.handle(event));
    }
}

async fn join_decode(
    task: &mut Option<JoinHandle<Result<Decoded, DecodeError>>>,
) -> Result<Result<Decoded, DecodeError>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn report(metrics: &Metrics, session: &ConnectionSession, kind: DecodeError) {
    metrics.failure(kind);
    let peer = session.remote();
    let protocol = session.protocol();
    match kind {
        DecodeError::BadTimestamp => {
            debug!(%peer, ?protocol, kind = kind.kind(), "Unusable vote timestamp; using receipt time")
        }
        DecodeError::Timeout | DecodeError::MalformedPayload | DecodeError::RateLimited => {
            debug!(%peer, ?protocol, kind = kind.kind(), "Vote connection failed")
        }
        _ => warn!(%peer, ?protocol, kind = kind.kind(), "Vote rejected"),
    }
}
