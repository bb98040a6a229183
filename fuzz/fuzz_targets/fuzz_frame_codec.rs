#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;
use votifier_protocol::core::codec::{Inbound, VoteFrameCodec};

fuzz_target!(|data: &[u8]| {
    let mut codec = VoteFrameCodec::new(Some(256), 1024);
    let mut buf = BytesMut::new();

    // Feed in uneven chunks to exercise partial reads
    for chunk in data.chunks(7) {
        buf.extend_from_slice(chunk);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(Inbound::Frame(frame))) => assert!(frame.len() <= 1024),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }
    let _ = codec.decode_eof(&mut buf);
});
