//! Wire protocol layer.
//!
//! This module defines the binary framing used between client and
//! display server, and the low-level tools to produce and consume it:
//! a bounds-checked [`cursor::Decoder`] over received bytes and a
//! [`frame::RequestBuilder`] that assembles outgoing requests in place
//! inside the write queue.
//!
//! # Binary format
//!
//! Every unit on the wire is a length-prefixed frame of little-endian
//! 32-bit words:
//!
//! - Request: `[length][serial][opcode][payload]`, where `length` counts
//!   everything after itself.
//! - Reply: `[length][serial][payload]`, matched to its request purely by
//!   serial equality.
//! - Asynchronous message: a reply frame whose serial is the reserved
//!   [`MSG_SERIAL`] marker; its payload starts with a message-type word
//!   followed by the event body (see [`crate::event`]).
//!
//! The handshake preceding frame traffic uses three ad-hoc exchanges
//! (ASCII version banner, type-descriptor block, challenge words) whose
//! constants also live here.

pub mod cursor;
pub mod frame;

/// Size of one protocol word. Both peers must agree on word width and
/// byte order; the handshake refuses the connection otherwise.
pub const WORD: usize = 4;

/// Reserved serial value marking a frame as an asynchronous message
/// rather than a reply. Never allocated to a request.
pub const MSG_SERIAL: u32 = u32::MAX;

/// Reply status word: operation succeeded, payload follows.
pub const REPLY_OK: u32 = 0;
/// Reply status word: operation rejected wholesale.
pub const REPLY_FAIL: u32 = u32::MAX;

/// "No such operation" wire id; the server answers the lookup operation
/// with it when an operation is unsupported.
pub const NO_ID: u32 = u32::MAX;

/// Challenge words of the authentication step.
pub const GO_MAGIC: u32 = u32::from_le_bytes(*b"go!!");
pub const WAIT_MAGIC: u32 = u32::from_le_bytes(*b"wait");

/// Protocol generation this engine speaks. Minor/patch are negotiated,
/// the major must match exactly.
pub const PROTOCOL_MAJOR: u8 = 4;

/// Literal banner prefix, checked byte-for-byte right after the banner's
/// length byte.
pub(crate) const BANNER_TAG: &[u8] = b"Twin-4.";

/// Type-descriptor block sent during the handshake: one length byte, one
/// size tag per primitive wire type, and a trailing word-sized magic that
/// doubles as a byte-order probe.
pub(crate) const TYPE_BLOCK: [u8; 14] = [
    14, // total block length, including this byte
    1,  // byte
    2,  // short
    2,  // cell attribute
    4,  // word
    4,  // object id
    4,  // color pair
    2,  // key code
    4,  // timestamp seconds
    8,  // message alignment
    b'T', b'w', b'i', b'n',
];

/// Shortest acceptable peer descriptor block: length byte, at least two
/// size tags, the trailing magic word.
pub(crate) const TYPE_BLOCK_MIN: usize = 1 + 2 + WORD;

/// TCP port base; the hex display number from the target string is added
/// to it.
pub const BASE_PORT: u16 = 7754;

/// Unix-socket path prefix; the display part of the target (":0") is
/// appended verbatim.
pub const SOCKET_PATH_PREFIX: &str = "/tmp/.Twin";

/// Environment fallback consulted when no explicit target is given.
pub const DISPLAY_ENV: &str = "TWDISPLAY";

/// Authorization secret file under the home directory.
pub const AUTH_FILE: &str = ".TwinAuth";
/// Secret plus peer-chosen random bytes always total this many bytes.
pub const CHALLENGE_TOTAL: usize = 512;
pub const DIGEST_LEN: usize = 16;

/// Well-known wire id of the operation-lookup operation itself; every
/// other operation id is resolved through it at run time.
pub const FIND_OP_WIRE_ID: u32 = 1;
