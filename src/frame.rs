use bytes::{Buf, BytesMut};
use serde_json::{Map, Value};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024;

/// One parsed structured-text object pulled off the byte stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Single(Map<String, Value>),
    Batch(Vec<Value>),
}

impl Frame {
    /// An object carrying `nodes` is a batch even when it also has a `nodeId`.
    pub fn from_object(mut object: Map<String, Value>) -> Self {
        match object.remove("nodes") {
            Some(Value::Array(items)) => Frame::Batch(items),
            Some(_) => Frame::Batch(Vec::new()),
            None => Frame::Single(object),
        }
    }

    /// Flattens the frame into the candidate field maps handed to the validator.
    pub fn into_candidates(self) -> Vec<Value> {
        match self {
            Frame::Single(object) => vec![Value::Object(object)],
            Frame::Batch(items) => items,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// Balanced delimiters but not parseable.
    Malformed,
    /// A line break arrived before the frame closed.
    Truncated,
    /// The open frame grew past the configured limit.
    Oversized,
    /// Parsed, but the top level was not an object.
    NotAnObject,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Extraction {
    Frame(Frame),
    Discarded(DiscardReason),
}

#[derive(Clone, Copy, Debug)]
pub struct ExtractorConfig {
    pub max_frame_bytes: usize,
    pub line_resync: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            line_resync: true,
        }
    }
}

enum Scan {
    Complete(usize),
    Truncated(usize),
    Incomplete,
}

/// Accumulates raw transport bytes and cuts them into frames delimited by a balanced
/// `{ ... }` pair. Anything outside a frame is noise and is dropped.
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: BytesMut,
    config: ExtractorConfig,
}

impl FrameExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(config.max_frame_bytes.min(4096)),
            config,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame (or discarded candidate), or `None` when more bytes
    /// are needed.
    pub fn next_frame(&mut self) -> Option<Extraction> {
        let Some(start) = self.buffer.iter().position(|byte| *byte == b'{') else {
            self.buffer.clear();
            return None;
        };
        self.buffer.advance(start);

        match scan_frame(&self.buffer, self.config.line_resync) {
            Scan::Complete(end) => {
                let candidate = self.buffer.split_to(end + 1);
                Some(parse_candidate(&candidate))
            }
            Scan::Truncated(at) => {
                self.buffer.advance(at + 1);
                Some(Extraction::Discarded(DiscardReason::Truncated))
            }
            Scan::Incomplete => {
                if self.buffer.len() > self.config.max_frame_bytes {
                    self.buffer.advance(1);
                    return Some(Extraction::Discarded(DiscardReason::Oversized));
                }
                None
            }
        }
    }
}

impl Iterator for FrameExtractor {
    type Item = Extraction;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

fn scan_frame(buf: &[u8], line_resync: bool) -> Scan {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in buf.iter().copied().enumerate() {
        if line_resync && byte == b'\n' {
            return Scan::Truncated(idx);
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Complete(idx);
                }
            }
            _ => {}
        }
    }

    Scan::Incomplete
}

fn parse_candidate(candidate: &[u8]) -> Extraction {
    match serde_json::from_slice::<Value>(candidate) {
        Ok(Value::Object(object)) => Extraction::Frame(Frame::from_object(object)),
        Ok(_) => Extraction::Discarded(DiscardReason::NotAnObject),
        Err(err) => {
            tracing::trace!(error=%err, len = candidate.len(), "discarding malformed frame");
            Extraction::Discarded(DiscardReason::Malformed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> FrameExtractor {
        FrameExtractor::new(ExtractorConfig::default())
    }

    fn frames(extractor: &mut FrameExtractor) -> Vec<Extraction> {
        extractor.by_ref().collect()
    }

    #[test]
    fn extracts_frame_surrounded_by_noise() {
        let mut ex = extractor();
        ex.push(b"\x00\xffboot ok\r\n{\"nodeId\":1,\"pm25\":45.2}\r\ntrailing");
        let out = frames(&mut ex);
        assert_eq!(out.len(), 1);
        let Extraction::Frame(Frame::Single(map)) = &out[0] else {
            panic!("expected single frame, got {out:?}");
        };
        assert_eq!(map.get("nodeId"), Some(&json!(1)));
        // trailing text without an opening brace is dropped
        assert_eq!(ex.buffered(), 0);
    }

    #[test]
    fn waits_for_frames_split_across_reads() {
        let mut ex = extractor();
        ex.push(br#"{"nodeId":2,"#);
        assert!(ex.next_frame().is_none());
        ex.push(br#""eco2":900}"#);
        let out = frames(&mut ex);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Extraction::Frame(Frame::Single(_))));
    }

    #[test]
    fn malformed_frame_is_discarded_and_next_frame_survives() {
        let mut ex = extractor();
        ex.push(br#"{"nodeId":1,"pm25":}{"nodeId":3,"co":1.5}"#);
        let out = frames(&mut ex);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Extraction::Discarded(DiscardReason::Malformed));
        assert!(matches!(out[1], Extraction::Frame(_)));
    }

    #[test]
    fn truncated_line_is_dropped_at_newline() {
        let mut ex = extractor();
        ex.push(b"{\"nodeId\":1,\"pm2\n{\"nodeId\":1,\"pm25\":3}\n");
        let out = frames(&mut ex);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Extraction::Discarded(DiscardReason::Truncated));
        assert!(matches!(out[1], Extraction::Frame(_)));
    }

    #[test]
    fn braces_inside_strings_do_not_close_frame() {
        let mut ex = extractor();
        ex.push(br#"{"nodeId":1,"nodeType":"ESP32 {rev \"b\"}","tvoc":12}"#);
        let out = frames(&mut ex);
        let [Extraction::Frame(Frame::Single(map))] = out.as_slice() else {
            panic!("expected one frame, got {out:?}");
        };
        assert_eq!(map.get("nodeType"), Some(&json!("ESP32 {rev \"b\"}")));
    }

    #[test]
    fn batch_frames_flatten_into_candidates() {
        let mut ex = extractor();
        ex.push(br#"{"nodes":[{"nodeId":1,"pm25":1},{"nodeId":2,"pm25":2}],"nodeId":9}"#);
        let Some(Extraction::Frame(frame)) = ex.next_frame() else {
            panic!("expected frame");
        };
        let candidates = frame.into_candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1]["nodeId"], json!(2));
    }

    #[test]
    fn non_array_nodes_is_an_empty_batch() {
        let frame = Frame::from_object(
            json!({"nodes": {"nodeId": 1}})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );
        assert_eq!(frame, Frame::Batch(Vec::new()));
        assert!(frame.into_candidates().is_empty());
    }

    #[test]
    fn oversized_open_frame_resyncs() {
        let mut ex = FrameExtractor::new(ExtractorConfig {
            max_frame_bytes: 32,
            line_resync: false,
        });
        ex.push(b"{\"junk\":\"");
        ex.push(&[b'x'; 64]);
        assert_eq!(
            ex.next_frame(),
            Some(Extraction::Discarded(DiscardReason::Oversized))
        );
        ex.push(br#"{"nodeId":1,"co":2}"#);
        let out = frames(&mut ex);
        assert!(out
            .iter()
            .any(|item| matches!(item, Extraction::Frame(Frame::Single(_)))));
    }
}
