#![no_main]

use libfuzzer_sys::fuzz_target;
use usc_tunnel::core::envelope::{decode, ENVELOPE_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok((env, used)) = decode(data) {
        assert_eq!(used, ENVELOPE_LEN);
        assert_eq!(&env.to_bytes()[..], &data[..ENVELOPE_LEN]);
    }
});
