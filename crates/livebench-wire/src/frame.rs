use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

const METHOD_FIELD: &str = "Method";
const CONTENT_LENGTH_FIELD: &str = "Content-Length";
const LINE_END: u8 = b'\n';
const FIELD_SEPARATOR: char = ':';

/// Upper bound on the header block. A peer that sends this much without a
/// blank line is not speaking the protocol.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid method name {0:?}")]
    InvalidMethod(String),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
}

pub fn encode_frame(method: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if method.is_empty()
        || method.contains(char::from(LINE_END))
        || method.contains(FIELD_SEPARATOR)
    {
        return Err(FrameError::InvalidMethod(method.to_owned()));
    }

    let header = format!(
        "{METHOD_FIELD}:{method}\n{CONTENT_LENGTH_FIELD}:{}\n\n",
        payload.len()
    );
    let mut buf = Vec::with_capacity(header.len() + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the header or the payload is still short; the
/// caller keeps the bytes and retries once more data arrived. On success the
/// second tuple element is the number of bytes the frame occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    decode_with_limit(buf, DEFAULT_MAX_PAYLOAD)
}

fn decode_with_limit(
    buf: &[u8],
    max_payload: usize,
) -> Result<Option<(Frame, usize)>, FrameError> {
    let Some(header_len) = header_end(buf)? else {
        return Ok(None);
    };

    let (method, content_length) = parse_header(&buf[..header_len])?;
    if content_length > max_payload {
        return Err(FrameError::PayloadTooLarge(content_length));
    }

    let total = header_len + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let frame = Frame {
        method,
        payload: Bytes::copy_from_slice(&buf[header_len..total]),
    };
    Ok(Some((frame, total)))
}

/// Length of the header block including the terminating blank line.
fn header_end(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.first() == Some(&LINE_END) {
        return Err(FrameError::Malformed("empty header"));
    }
    let end = buf
        .windows(2)
        .position(|pair| pair == [LINE_END, LINE_END])
        .map(|idx| idx + 2);
    match end {
        Some(end) if end > MAX_HEADER_BYTES => Err(FrameError::Malformed("header too long")),
        Some(end) => Ok(Some(end)),
        None if buf.len() > MAX_HEADER_BYTES => Err(FrameError::Malformed("header too long")),
        None => Ok(None),
    }
}

fn parse_header(header: &[u8]) -> Result<(String, usize), FrameError> {
    let text =
        std::str::from_utf8(header).map_err(|_| FrameError::Malformed("header is not utf-8"))?;

    let mut method = None;
    let mut content_length = None;
    for line in text.split(char::from(LINE_END)).filter(|line| !line.is_empty()) {
        let Some((field, value)) = line.split_once(FIELD_SEPARATOR) else {
            return Err(FrameError::Malformed("header line without separator"));
        };
        match field {
            METHOD_FIELD => method = Some(value.to_owned()),
            CONTENT_LENGTH_FIELD => {
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(FrameError::Malformed("content length is not decimal"));
                }
                let parsed = value
                    .parse::<usize>()
                    .map_err(|_| FrameError::Malformed("content length out of range"))?;
                content_length = Some(parsed);
            }
            _ => {}
        }
    }

    let content_length =
        content_length.ok_or(FrameError::Malformed("missing content length"))?;
    match method {
        Some(method) if !method.is_empty() => Ok((method, content_length)),
        _ => Err(FrameError::Malformed("missing method")),
    }
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_with_limit(&self.buf, self.max_payload)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_exact_wire_bytes() {
        let bytes = encode_frame("echo(QString)", b"hello").unwrap();
        assert_eq!(
            bytes,
            b"Method:echo(QString)\nContent-Length:5\n\nhello".to_vec()
        );
    }

    #[test]
    fn round_trips_empty_and_binary_payloads() {
        for payload in [&b""[..], &b"\n\n\x00\xffMethod:x\n"[..], &[7u8; 4096][..]] {
            let bytes = encode_frame("setActiveDocument", payload).unwrap();
            let (frame, consumed) = decode_frame(&bytes).unwrap().expect("complete frame");
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.method, "setActiveDocument");
            assert_eq!(frame.payload.as_ref(), payload);
        }
    }

    #[test]
    fn rejects_methods_with_delimiters() {
        assert!(matches!(
            encode_frame("bad\nname", b""),
            Err(FrameError::InvalidMethod(_))
        ));
        assert!(matches!(
            encode_frame("bad:name", b""),
            Err(FrameError::InvalidMethod(_))
        ));
        assert!(matches!(encode_frame("", b""), Err(FrameError::InvalidMethod(_))));
    }

    #[test]
    fn short_header_or_payload_is_incomplete() {
        let bytes = encode_frame("ping", b"0123456789").unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode_frame(&bytes[..cut]), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn malformed_headers_are_reported() {
        assert_eq!(
            decode_frame(b"Content-Length:0\n\n"),
            Err(FrameError::Malformed("missing method"))
        );
        assert_eq!(
            decode_frame(b"Method:ping\n\n"),
            Err(FrameError::Malformed("missing content length"))
        );
        assert_eq!(
            decode_frame(b"Method:ping\nContent-Length:-4\n\n"),
            Err(FrameError::Malformed("content length is not decimal"))
        );
        assert_eq!(
            decode_frame(b"\nMethod:ping"),
            Err(FrameError::Malformed("empty header"))
        );
        let junk = vec![b'a'; MAX_HEADER_BYTES + 1];
        assert_eq!(
            decode_frame(&junk),
            Err(FrameError::Malformed("header too long"))
        );
    }

    #[test]
    fn unknown_header_fields_are_ignored() {
        let (frame, _) = decode_frame(b"Method:ping\nX-Trace:abc\nContent-Length:2\n\nok")
            .unwrap()
            .unwrap();
        assert_eq!(frame.method, "ping");
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn decoder_splits_back_to_back_frames_fed_bytewise() {
        let mut stream = encode_frame("first", b"a").unwrap();
        stream.extend(encode_frame("second", b"").unwrap());
        stream.extend(encode_frame("third", b"ccc").unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        let methods: Vec<_> = frames.iter().map(|f| f.method.as_str()).collect();
        assert_eq!(methods, ["first", "second", "third"]);
        assert_eq!(frames[2].payload.as_ref(), b"ccc");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_enforces_payload_limit() {
        let mut decoder = FrameDecoder::with_max_payload(4);
        decoder.push(b"Method:big\nContent-Length:5\n\n");
        assert_eq!(decoder.next_frame(), Err(FrameError::PayloadTooLarge(5)));
    }
}
