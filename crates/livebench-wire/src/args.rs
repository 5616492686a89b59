//! Argument vector codec for follower → master forwarding.
//!
//! Layout: `u32` big-endian string count, then per string a `u32`
//! big-endian byte length followed by that many UTF-8 bytes.

use thiserror::Error;

const LEN_PREFIX: usize = 4;

pub const MAX_ARGUMENT_BYTES: usize = 1024 * 1024;
pub const MAX_ARGUMENT_COUNT: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentsError {
    #[error("too many arguments: {0}")]
    TooMany(usize),
    #[error("argument {index} too large: {len} bytes")]
    TooLarge { index: usize, len: usize },
    #[error("argument {index} is not valid utf-8")]
    InvalidUtf8 { index: usize },
}

pub fn encode<S: AsRef<str>>(arguments: &[S]) -> Result<Vec<u8>, ArgumentsError> {
    if arguments.len() > MAX_ARGUMENT_COUNT {
        return Err(ArgumentsError::TooMany(arguments.len()));
    }
    let body: usize = arguments
        .iter()
        .map(|arg| LEN_PREFIX + arg.as_ref().len())
        .sum();
    let mut buf = Vec::with_capacity(LEN_PREFIX + body);
    buf.extend_from_slice(&(arguments.len() as u32).to_be_bytes());
    for (index, arg) in arguments.iter().enumerate() {
        let bytes = arg.as_ref().as_bytes();
        if bytes.len() > MAX_ARGUMENT_BYTES {
            return Err(ArgumentsError::TooLarge {
                index,
                len: bytes.len(),
            });
        }
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
    }
    Ok(buf)
}

/// Decodes an argument vector from the front of `buf`.
///
/// `Ok(None)` means the vector is not complete yet; this is the normal state
/// while a follower's bytes are still arriving.
pub fn decode(buf: &[u8]) -> Result<Option<(Vec<String>, usize)>, ArgumentsError> {
    let Some(count) = read_len(buf, 0) else {
        return Ok(None);
    };
    if count > MAX_ARGUMENT_COUNT {
        return Err(ArgumentsError::TooMany(count));
    }

    let mut offset = LEN_PREFIX;
    let mut arguments = Vec::with_capacity(count);
    for index in 0..count {
        let Some(len) = read_len(buf, offset) else {
            return Ok(None);
        };
        if len > MAX_ARGUMENT_BYTES {
            return Err(ArgumentsError::TooLarge { index, len });
        }
        offset += LEN_PREFIX;
        let Some(bytes) = buf.get(offset..offset + len) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(bytes).map_err(|_| ArgumentsError::InvalidUtf8 { index })?;
        arguments.push(text.to_owned());
        offset += len;
    }
    Ok(Some((arguments, offset)))
}

fn read_len(buf: &[u8], offset: usize) -> Option<usize> {
    let raw: [u8; LEN_PREFIX] = buf.get(offset..offset + LEN_PREFIX)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_forwarded_vector() {
        let args = vec!["--stayontop".to_string(), "/tmp/proj".to_string()];
        let bytes = encode(&args).unwrap();
        let (decoded, consumed) = decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, args);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn empty_vector_and_empty_strings() {
        let bytes = encode::<&str>(&[]).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(decode(&bytes).unwrap(), Some((Vec::new(), 4)));

        let bytes = encode(&["", "ü"]).unwrap();
        let (decoded, _) = decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, vec!["".to_string(), "ü".to_string()]);
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        let bytes = encode(&["livebench", "--ping", "workspace"]).unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode(&bytes[..cut]).unwrap(), None, "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_left_for_the_caller() {
        let mut bytes = encode(&["a"]).unwrap();
        let len = bytes.len();
        bytes.extend_from_slice(b"junk");
        let (_, consumed) = decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, len);
    }

    #[test]
    fn rejects_invalid_utf8_and_oversized_declarations() {
        let mut bytes = vec![0, 0, 0, 1, 0, 0, 0, 2];
        bytes.extend_from_slice(&[0xc3, 0x28]);
        assert_eq!(
            decode(&bytes),
            Err(ArgumentsError::InvalidUtf8 { index: 0 })
        );

        let huge = (MAX_ARGUMENT_COUNT as u32 + 1).to_be_bytes();
        assert_eq!(
            decode(&huge),
            Err(ArgumentsError::TooMany(MAX_ARGUMENT_COUNT + 1))
        );

        let mut bytes = vec![0, 0, 0, 1];
        bytes.extend_from_slice(&(MAX_ARGUMENT_BYTES as u32 + 1).to_be_bytes());
        assert_eq!(
            decode(&bytes),
            Err(ArgumentsError::TooLarge {
                index: 0,
                len: MAX_ARGUMENT_BYTES + 1
            })
        );
    }
}
