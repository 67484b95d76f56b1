//! Fuzz target for the frame decoder.
//!
//! Tests that arbitrary bytes, fed in arbitrary chunk sizes, never panic
//! the decoder and that anything it accepts re-encodes to the same bytes.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use repmgr::wire::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: (u8, &[u8])| {
    let (chunk, bytes) = data;
    let chunk = (chunk as usize).max(1);

    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::new();

    for piece in bytes.chunks(chunk) {
        buf.extend_from_slice(piece);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(msg)) => {
                    // Accepted frames must survive a round trip
                    let again = codec.decode(&mut BytesMut::from(&msg.to_frame()[..]));
                    assert_eq!(again.ok().flatten(), Some(msg));
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
