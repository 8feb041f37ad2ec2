#![no_main]
use libfuzzer_sys::fuzz_target;
use weigh_core::config::FramingCfg;
use weigh_core::framing::{FrameDecoder, ValueParser};

fuzz_target!(|chunks: Vec<Vec<u8>>| {
    let cfg = FramingCfg::default();
    let mut decoder = FrameDecoder::new(&cfg);
    let parser = ValueParser::new(&cfg);
    for chunk in &chunks {
        for frame in decoder.push(chunk) {
            let _ = parser.parse(&frame);
        }
        assert!(decoder.buffered() <= cfg.buffer_cap);
    }
});
