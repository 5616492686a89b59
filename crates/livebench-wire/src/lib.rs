//! Byte formats spoken between livebench processes.
//!
//! Two unrelated formats live here:
//!
//! - [`frame`]: the textual command frame sent to remote hosts
//!   (`Method:<name>\nContent-Length:<n>\n\n<payload>`).
//! - [`args`]: the length-prefixed argument vector a follower hands to the
//!   running master over the local socket.

pub mod args;
pub mod frame;

pub use args::{ArgumentsError, MAX_ARGUMENT_BYTES, MAX_ARGUMENT_COUNT};
pub use frame::{
    DEFAULT_MAX_PAYLOAD, Frame, FrameDecoder, FrameError, MAX_HEADER_BYTES, decode_frame,
    encode_frame,
};
