//! Byte-stream framing and value extraction for transport mode.
//!
//! `FrameDecoder` accumulates raw bytes and yields complete frames: first any
//! start/end-marker delimited frames, then, only when none was found, a
//! CR/LF terminated line. `ValueParser` turns a frame into a number using the
//! configured encoding and regex.
use crate::config::{FramingCfg, TextEncoding};
use regex::Regex;

#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    cap: usize,
    start: Option<u8>,
    end: Option<u8>,
}

impl FrameDecoder {
    pub fn new(cfg: &FramingCfg) -> Self {
        Self {
            buf: Vec::with_capacity(cfg.buffer_cap.min(8192)),
            cap: cfg.buffer_cap,
            start: cfg.start_marker,
            end: cfg.end_marker,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and return every frame that is now complete, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.cap {
            // Keep the newest half; a frame split by the cut is lost.
            let keep = self.cap / 2;
            let cut = self.buf.len() - keep;
            self.buf.drain(..cut);
            tracing::debug!(kept = keep, "frame buffer overflow; trimmed");
        }

        let mut frames = Vec::new();
        loop {
            let delimited = self.take_delimited();
            if !delimited.is_empty() {
                frames.extend(delimited);
                continue;
            }
            match self.take_line() {
                Some(line) => frames.push(line),
                None => break,
            }
        }
        frames
    }

    fn take_delimited(&mut self) -> Vec<Vec<u8>> {
        let (Some(start), Some(end)) = (self.start, self.end) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(s) = self.buf.iter().position(|&b| b == start) {
            match self.buf[s + 1..].iter().position(|&b| b == end) {
                Some(rel) => {
                    let e = s + 1 + rel;
                    out.push(self.buf[s + 1..e].to_vec());
                    self.buf.drain(..=e);
                }
                None => {
                    // Leading noise can never be part of a frame.
                    if s > 0 {
                        self.buf.drain(..s);
                    }
                    break;
                }
            }
        }
        out
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let nl = self.buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
        let line = self.buf[..nl].to_vec();
        self.buf.drain(..=nl);
        Some(line)
    }
}

/// Best-effort decode; bytes that are invalid for the encoding are dropped.
pub fn decode_text(bytes: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Ascii => bytes
            .iter()
            .filter(|b| b.is_ascii())
            .map(|&b| b as char)
            .collect(),
        TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        TextEncoding::Utf8 => String::from_utf8_lossy(bytes)
            .chars()
            .filter(|&c| c != char::REPLACEMENT_CHARACTER)
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct ValueParser {
    regex: Regex,
    encoding: TextEncoding,
    divisor: f64,
    zero_threshold: f64,
}

impl ValueParser {
    pub fn new(cfg: &FramingCfg) -> Self {
        Self {
            regex: cfg.regex.clone(),
            encoding: cfg.encoding,
            divisor: if cfg.parse_divisor > 0.0 {
                cfg.parse_divisor
            } else {
                1.0
            },
            zero_threshold: cfg.zero_threshold,
        }
    }

    /// `None` when the frame does not match or the capture is not a number.
    pub fn parse(&self, frame: &[u8]) -> Option<f64> {
        let text = decode_text(frame, self.encoding);
        let caps = self.regex.captures(&text)?;
        let m = caps.name("weight").or_else(|| caps.get(1)).or_else(|| caps.get(0))?;
        let v = m.as_str().trim().parse::<f64>().ok()? / self.divisor;
        if !v.is_finite() {
            return None;
        }
        if self.zero_threshold > 0.0 && v.abs() <= self.zero_threshold {
            return Some(0.0);
        }
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(regex: &str, divisor: f64) -> FramingCfg {
        FramingCfg {
            regex: Regex::new(regex).expect("regex"),
            parse_divisor: divisor,
            ..FramingCfg::default()
        }
    }

    #[test]
    fn stx_etx_frame_round_trip() {
        let c = cfg(r"([+-]\d{8})B", 1000.0);
        let mut dec = FrameDecoder::new(&c);
        let frames = dec.push(b"\x02+00015240B\x03");
        assert_eq!(frames, vec![b"+00015240B".to_vec()]);
        let v = ValueParser::new(&c).parse(&frames[0]).expect("value");
        assert!((v - 15.240).abs() < 1e-9);
    }

    #[test]
    fn frame_split_across_reads() {
        let c = FramingCfg::default();
        let mut dec = FrameDecoder::new(&c);
        assert!(dec.push(b"noise\x02+12").is_empty());
        // leading noise before STX was discarded
        assert_eq!(dec.buffered(), 4);
        let frames = dec.push(b".5\x03\x02-3\x03");
        assert_eq!(frames, vec![b"+12.5".to_vec(), b"-3".to_vec()]);
    }

    #[test]
    fn newline_fallback_splits_on_first_cr_or_lf() {
        let c = FramingCfg::default();
        let mut dec = FrameDecoder::new(&c);
        let frames = dec.push(b"ST,GS,  12.5kg\r\nST,GS,  13.0kg\r\n");
        let p = ValueParser::new(&c);
        let values: Vec<f64> = frames.iter().filter_map(|f| p.parse(f)).collect();
        assert_eq!(values, vec![12.5, 13.0]);
    }

    #[test]
    fn unterminated_frame_is_bounded() {
        let c = FramingCfg {
            buffer_cap: 128,
            ..FramingCfg::default()
        };
        let mut dec = FrameDecoder::new(&c);
        for _ in 0..100 {
            dec.push(b"\x02garbage-without-end");
        }
        assert!(dec.buffered() <= 128);
    }

    #[test]
    fn named_group_wins_over_first_group() {
        let c = cfg(r"(ST|US),(?P<weight>[+-]?\d+\.\d+)", 1.0);
        assert_eq!(ValueParser::new(&c).parse(b"US,+0042.10"), Some(42.1));
    }

    #[test]
    fn non_matching_text_yields_nothing() {
        let c = FramingCfg::default();
        assert_eq!(ValueParser::new(&c).parse(b"ERR OVERLOAD"), None);
    }

    #[test]
    fn zero_threshold_snaps_small_values() {
        let c = FramingCfg {
            zero_threshold: 0.5,
            ..FramingCfg::default()
        };
        let p = ValueParser::new(&c);
        assert_eq!(p.parse(b"0.3"), Some(0.0));
        assert_eq!(p.parse(b"0.7"), Some(0.7));
    }

    #[test]
    fn ascii_decode_drops_high_bytes() {
        assert_eq!(decode_text(b"1\xff2", TextEncoding::Ascii), "12");
        assert_eq!(decode_text(b"1\xff2", TextEncoding::Utf8), "12");
        assert_eq!(decode_text(b"\xb0", TextEncoding::Latin1), "\u{b0}");
    }
}
