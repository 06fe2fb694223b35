#![no_main]

use libfuzzer_sys::fuzz_target;
use usc_tunnel::core::buffer::IoBuffer;
use usc_tunnel::core::session::{Deframer, SessionBinding};

// First byte picks the read size, the rest is the TLS-side byte stream
fuzz_target!(|data: &[u8]| {
    let Some((&cut, wire)) = data.split_first() else {
        return;
    };
    let step = usize::from(cut).max(1);
    let binding = SessionBinding::defaults();
    let mut buf = IoBuffer::with_capacity(1024);
    let mut deframer = Deframer::new();

    for piece in wire.chunks(step) {
        if buf.extend_from_slice(piece).is_err() {
            return;
        }
        loop {
            match deframer.next(&mut buf) {
                Ok(Some(env)) => {
                    if binding.check(&env).is_ok() {
                        deframer.accept();
                    } else {
                        deframer.reject();
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        let ready = deframer.ready();
        assert!(ready <= buf.len());
        if deframer.consume(&mut buf, ready).is_err() {
            return;
        }
    }
});
