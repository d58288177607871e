#![no_main]

use broker_tether::client::ConnectionParameters;
use broker_tether::Overrides;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing must never panic, whatever the input
    for url in [input.to_string(), format!("amqp://{}", input), format!("amqps://{}", input)] {
        if let Ok(overrides) = Overrides::from_url(&url) {
            // Resolution may fail on unreadable TLS files but must not panic
            let _ = ConnectionParameters::new(overrides);
        }
    }
});
