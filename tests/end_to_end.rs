//! End-to-end tests: a real listener on a loopback port, driven by the
//! bundled client and by raw sockets.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use votifier_protocol::config::{RateLimitConfig, VotifierConfig};
use votifier_protocol::protocol::handshake::ServerGreeting;
use votifier_protocol::protocol::v2;
use votifier_protocol::service::{send_v1_vote, send_v2_vote, VoteClient};
use votifier_protocol::utils::keys::RsaKeyPair;
use votifier_protocol::{
    DecodeError, EventDispatcher, HandlerError, KeyMaterial, ProtocolError, ProtocolVersion, Vote,
    VoteListener,
};

const SECRET: &[u8] = b"e2e-shared-secret";

fn rsa_pair() -> &'static RsaKeyPair {
    static PAIR: OnceLock<RsaKeyPair> = OnceLock::new();
    PAIR.get_or_init(|| RsaKeyPair::generate(1024).expect("key generation"))
}

fn keys() -> Arc<KeyMaterial> {
    Arc::new(
        KeyMaterial::new()
            .with_rsa(rsa_pair().clone())
            .with_token("default", SECRET),
    )
}

fn config() -> VotifierConfig {
    VotifierConfig::default_with_overrides(|c| {
        c.server.connection_timeout = Duration::from_millis(300);
        c.server.shutdown_timeout = Duration::from_millis(200);
        c.rate_limit = RateLimitConfig::unlimited();
    })
}

fn vote() -> Vote {
    Vote::new(
        "ExampleList",
        "Steve",
        "1.2.3.4",
        UNIX_EPOCH + Duration::from_millis(1_700_000_000_000),
    )
    .unwrap()
}

/// Dispatcher that records every vote it sees.
fn recording_dispatcher() -> (Arc<EventDispatcher>, Arc<Mutex<Vec<Vote>>>) {
    let dispatcher = Arc::new(EventDispatcher::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    dispatcher
        .register_handler(move |vote: &Vote| {
            sink.lock().unwrap().push(vote.clone());
            Ok(())
        })
        .unwrap();
    (dispatcher, seen)
}

async fn start(config: &VotifierConfig, dispatcher: Arc<EventDispatcher>) -> VoteListener {
    VoteListener::start("127.0.0.1:0", keys(), config, dispatcher)
        .await
        .expect("listener start")
}

/// Connect and read the greeting line.
async fn greet(addr: &str) -> (BufReader<TcpStream>, ServerGreeting) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    (reader, ServerGreeting::parse(&line).unwrap())
}

#[tokio::test]
async fn test_v1_vote_dispatched_exactly_once() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    send_v1_vote(&addr, &vote(), rsa_pair().public_key())
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![vote()]);
    assert_eq!(listener.metrics().snapshot().votes_received, 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_v2_vote_acknowledged_and_dispatched() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    send_v2_vote(&addr, &vote(), Some("default"), SECRET)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![vote()]);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_v2_without_identifier_falls_back_to_default() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    send_v2_vote(&addr, &vote(), None, SECRET).await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_token_dispatches_nothing() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    let result = send_v2_vote(&addr, &vote(), Some("missing"), SECRET).await;

    assert!(result.is_err(), "listener must not acknowledge");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(listener.metrics().failures(DecodeError::UnknownToken), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_secret_is_bad_signature() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    let result = send_v2_vote(&addr, &vote(), Some("default"), b"not-the-secret").await;

    assert!(result.is_err());
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(listener.metrics().failures(DecodeError::BadSignature), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    let (mut reader, greeting) = greet(&addr).await;
    assert_eq!(greeting.version, ProtocolVersion::V2);

    // Send nothing; the listener closes once the budget is spent.
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), reader.read_to_end(&mut rest))
        .await
        .expect("listener should close the idle connection")
        .unwrap();

    assert!(rest.is_empty());
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(listener.metrics().failures(DecodeError::Timeout), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_peer_gets_no_greeting() {
    let (dispatcher, _seen) = recording_dispatcher();
    let mut config = config();
    config.rate_limit = RateLimitConfig {
        max_connections_per_window: 1,
        ..RateLimitConfig::default()
    };
    let listener = start(&config, dispatcher).await;
    let addr = listener.local_addr().to_string();

    send_v2_vote(&addr, &vote(), Some("default"), SECRET)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut received))
        .await
        .expect("refused socket should be closed")
        .ok();

    assert!(received.is_empty(), "refused peer must not see a greeting");
    assert_eq!(listener.metrics().failures(DecodeError::RateLimited), 1);
    assert_eq!(listener.metrics().snapshot().rate_limited, 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_captured_message_replayed_on_new_connection() {
    let (dispatcher, seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    let (mut reader, greeting) = greet(&addr).await;
    let challenge = greeting.challenge.unwrap();
    let frame = v2::encode(&vote(), Some("default"), SECRET, &challenge).unwrap();
    reader.get_mut().write_all(&frame).await.unwrap();
    let mut reply = String::new();
    reader.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "{\"status\":\"ok\"}\r\n");

    let (mut reader, _) = greet(&addr).await;
    reader.get_mut().write_all(&frame).await.unwrap();
    let mut rest = Vec::new();
    let _ = reader.read_to_end(&mut rest).await;

    assert!(rest.is_empty(), "replay must not be acknowledged");
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(listener.metrics().failures(DecodeError::ChallengeMismatch), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_handler_does_not_block_others() {
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher
        .register_handler(|_: &Vote| Err(HandlerError::new("storage offline")))
        .unwrap();
    dispatcher
        .register_handler(|_: &Vote| panic!("handler bug"))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    dispatcher
        .register_handler(move |vote: &Vote| {
            sink.lock().unwrap().push(vote.clone());
            Ok(())
        })
        .unwrap();

    let listener = start(&config(), dispatcher.clone()).await;
    let addr = listener.local_addr().to_string();

    send_v2_vote(&addr, &vote(), Some("default"), SECRET)
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(dispatcher.stats(), (1, 2));
    assert!(listener.is_running().await);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_releases_port() {
    let (dispatcher, _seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr();

    assert!(listener.is_running().await);
    listener.stop().await.unwrap();
    listener.stop().await.unwrap();
    assert!(!listener.is_running().await);

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stop_lets_in_flight_handler_finish() {
    let (dispatcher, _seen) = recording_dispatcher();
    let listener = start(&config(), dispatcher).await;
    let addr = listener.local_addr().to_string();

    // Parked mid-handshake; stop must not wait longer than the grace period
    // plus the connection budget.
    let (_reader, _) = greet(&addr).await;
    tokio::time::timeout(Duration::from_secs(2), listener.stop())
        .await
        .expect("stop should finish within the grace period")
        .unwrap();
    assert_eq!(listener.metrics().snapshot().connections_active, 0);
}

#[tokio::test]
async fn test_disabled_v1_refuses_rsa_blocks() {
    let (dispatcher, seen) = recording_dispatcher();
    let mut config = config();
    config.server.disable_v1 = true;
    let listener = start(&config, dispatcher).await;
    let addr = listener.local_addr().to_string();

    // The listener just closes; whether the client sees a clean EOF or a
    // reset depends on timing.
    let _ = VoteClient::new(addr.clone())
        .with_timeout(Duration::from_secs(2))
        .send_v1(&vote(), rsa_pair().public_key())
        .await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(listener.metrics().failures(DecodeError::UnknownOpcode), 1);

    // V2 is still served.
    send_v2_vote(&addr, &vote(), Some("default"), SECRET)
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_requires_a_protocol() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let result =
        VoteListener::start("127.0.0.1:0", Arc::new(KeyMaterial::new()), &config(), dispatcher)
            .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_start_binds_hostname_regardless_of_configured_address() {
    let (dispatcher, seen) = recording_dispatcher();
    let mut config = config();
    config.server.address = "votes.example.invalid:8192".to_string();

    let listener = VoteListener::start("localhost:0", keys(), &config, dispatcher)
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();

    send_v2_vote(&addr, &vote(), Some("default"), SECRET)
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_from_config_rejects_bad_keys_before_generating() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.server.address = "127.0.0.1:0".to_string();
    config.keys.rsa_directory = dir.path().join("rsa");
    config.keys.key_bits = 256;

    let (dispatcher, _seen) = recording_dispatcher();
    let result = VoteListener::from_config(&mut config, dispatcher).await;

    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    assert!(!dir.path().join("rsa").exists());
    assert!(config.keys.tokens.is_empty());
}

#[tokio::test]
async fn test_from_config_rejects_unparseable_address() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.server.address = "not an address".to_string();
    config.keys.rsa_directory = dir.path().join("rsa");

    let (dispatcher, _seen) = recording_dispatcher();
    let result = VoteListener::from_config(&mut config, dispatcher).await;

    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    assert!(!dir.path().join("rsa").exists());
}

#[tokio::test]
async fn test_from_config_generates_and_persists_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.server.address = "127.0.0.1:0".to_string();
    config.keys.rsa_directory = dir.path().join("rsa");
    config.keys.key_bits = 1024;

    let (dispatcher, seen) = recording_dispatcher();
    let listener = VoteListener::from_config(&mut config, dispatcher)
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();

    assert!(dir.path().join("rsa").join("public.key").exists());
    let token = config.keys.tokens.get("default").cloned().unwrap();

    send_v2_vote(&addr, &vote(), None, token.as_bytes())
        .await
        .unwrap();
    let pair = RsaKeyPair::load_dir(dir.path().join("rsa")).unwrap();
    send_v1_vote(&addr, &vote(), pair.public_key())
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().len(), 2);
    listener.stop().await.unwrap();
}
