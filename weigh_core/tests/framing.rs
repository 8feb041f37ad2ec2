use proptest::prelude::*;
use weigh_core::config::FramingCfg;
use weigh_core::framing::{FrameDecoder, ValueParser};

fn stx_frames(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        out.push(0x02);
        out.extend_from_slice(format!("{v:+09}B").as_bytes());
        out.push(0x03);
    }
    out
}

fn decode_in_chunks(stream: &[u8], cuts: &[usize], cfg: &FramingCfg) -> Vec<f64> {
    let mut dec = FrameDecoder::new(cfg);
    let parser = ValueParser::new(cfg);
    let mut out = Vec::new();
    let mut rest = stream;
    for &c in cuts {
        let n = c.min(rest.len());
        let (head, tail) = rest.split_at(n);
        out.extend(dec.push(head).iter().filter_map(|f| parser.parse(f)));
        rest = tail;
    }
    out.extend(dec.push(rest).iter().filter_map(|f| parser.parse(f)));
    out
}

fn eight_digit_cfg() -> FramingCfg {
    FramingCfg {
        regex: regex::Regex::new(r"([+-]\d{8})B").expect("regex"),
        parse_divisor: 1000.0,
        ..FramingCfg::default()
    }
}

#[test]
fn fixed_eight_digit_frame_parses_with_divisor() {
    let vals = decode_in_chunks(b"\x02+00015240B\x03", &[], &eight_digit_cfg());
    assert_eq!(vals, vec![15.24]);
}

#[test]
fn noise_between_frames_is_ignored() {
    let mut stream = b"\xff\xfegarbage".to_vec();
    stream.extend(stx_frames(&[1000]));
    stream.extend_from_slice(b"junk");
    stream.extend(stx_frames(&[-2500]));
    let vals = decode_in_chunks(&stream, &[3, 7], &eight_digit_cfg());
    assert_eq!(vals, vec![1.0, -2.5]);
}

proptest! {
    #[test]
    fn chunking_never_changes_the_decoded_values(
        values in prop::collection::vec(-9_999_999i32..9_999_999, 1..30),
        cuts in prop::collection::vec(1usize..16, 0..40),
    ) {
        let cfg = eight_digit_cfg();
        let stream = stx_frames(&values);
        let expected: Vec<f64> = values.iter().map(|v| f64::from(*v) / 1000.0).collect();
        prop_assert_eq!(decode_in_chunks(&stream, &cuts, &cfg), expected);
    }

    #[test]
    fn decoder_memory_stays_bounded(junk in prop::collection::vec(any::<u8>(), 0..4096)) {
        let cfg = FramingCfg { buffer_cap: 256, ..FramingCfg::default() };
        let mut dec = FrameDecoder::new(&cfg);
        for chunk in junk.chunks(64) {
            dec.push(chunk);
            prop_assert!(dec.buffered() <= 256);
        }
    }
}
