#![no_main]
use ddp_client::{Connection, ConnectionHooks, ConnectionOptions, MockStream, StreamEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Parsing must never panic on arbitrary input.
        let _ = ddp_client::protocol::parse_server_frame(s);

        // Neither may feeding it to a live connection; errors are fine.
        let options = ConnectionOptions {
            heartbeat_interval_ms: 0,
            buffered_writes_interval_ms: 0,
            ..ConnectionOptions::default()
        };
        if let Ok(mut conn) =
            Connection::new(Box::new(MockStream::new()), options, ConnectionHooks::default())
        {
            let _ = conn.handle_stream_event(StreamEvent::Reset);
            let _ = conn.on_message(r#"{"msg":"connected","session":"fuzz"}"#);
            let _ = conn.on_message(s);
        }
    }
});
