#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use couchbase_core::protocol::OperationFrame;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    while !buf.is_empty() {
        match OperationFrame::read_from(&mut buf) {
            Ok(Some(frame)) => {
                let _ = frame.status();
                let _ = frame.body_len();
                let _ = frame.wire_size();
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
});
