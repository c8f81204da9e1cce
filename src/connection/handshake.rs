//! Connection handshake: version, type sizes, authorization.
//!
//! Three exchanges run on the freshly connected socket before any frame
//! traffic (and before compression can be negotiated, so everything here
//! is plain bytes):
//!
//! 1. The server sends a length-prefixed ASCII banner naming its protocol
//!    version. The major generation must match ours exactly.
//! 2. Both sides exchange a type-descriptor block listing the byte size
//!    of each primitive wire type, terminated by a word-sized magic. A
//!    size mismatch is unrecoverable; the same magic arriving
//!    byte-reversed pinpoints an endianness mismatch instead.
//! 3. The server answers with a go-ahead word, or demands proof that we
//!    can read the user's authorization file: it sends random bytes, and
//!    we return the MD5 digest of the secret concatenated with them.
//!
//! The handshake runs strictly single-threaded on a connection no other
//! thread has seen yet, so it reads and writes the stream directly.

use std::env;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::Error;
use crate::protocol::{
    AUTH_FILE, BANNER_TAG, CHALLENGE_TOTAL, DIGEST_LEN, GO_MAGIC, PROTOCOL_MAJOR, TYPE_BLOCK,
    TYPE_BLOCK_MIN, WAIT_MAGIC, WORD,
};

/// Runs the full handshake; returns the server's version triple.
pub(crate) fn run<S: Read + Write>(
    stream: &mut S,
    auth_override: Option<&Path>,
) -> Result<[u8; 3], Error> {
    let version = check_version(stream)?;
    check_type_sizes(stream)?;
    authorize(stream, auth_override)?;
    debug!(
        "handshake complete, server speaks {}.{}.{}",
        version[0], version[1], version[2]
    );
    Ok(version)
}

fn read_exact<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(buf).map_err(|_| Error::ConnectionLost)
}

fn read_u32<S: Read>(stream: &mut S) -> Result<u32, Error> {
    let mut b = [0u8; WORD];
    read_exact(stream, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Length-prefixed block: one length byte counting the whole block,
/// itself included.
fn read_block<S: Read>(stream: &mut S) -> Result<Vec<u8>, Error> {
    let mut len = [0u8];
    read_exact(stream, &mut len)?;
    if len[0] == 0 {
        return Err(Error::Protocol);
    }
    let mut block = vec![0u8; len[0] as usize];
    block[0] = len[0];
    read_exact(stream, &mut block[1..])?;
    Ok(block)
}

fn send<S: Write>(stream: &mut S, data: &[u8]) -> Result<(), Error> {
    stream.write_all(data).map_err(Error::Write)?;
    stream.flush().map_err(Error::Write)
}

fn check_version<S: Read>(stream: &mut S) -> Result<[u8; 3], Error> {
    let banner = read_block(stream)?;
    let body = &banner[1..];
    if body.len() < BANNER_TAG.len() || &body[..BANNER_TAG.len()] != BANNER_TAG {
        return Err(Error::ProtocolVersion);
    }
    // past "Twin-4." sit "minor.patch" as decimal digit runs
    let mut rest = body[BANNER_TAG.len()..].iter();
    let mut triple = [PROTOCOL_MAJOR, 0, 0];
    for slot in triple[1..].iter_mut() {
        let mut seen = false;
        for &c in rest.by_ref() {
            match c {
                b'0'..=b'9' => {
                    *slot = slot.wrapping_mul(10).wrapping_add(c - b'0');
                    seen = true;
                }
                b'.' | b'\0' => break,
                _ => return Err(Error::ProtocolVersion),
            }
        }
        if !seen {
            return Err(Error::ProtocolVersion);
        }
    }
    Ok(triple)
}

fn check_type_sizes<S: Read + Write>(stream: &mut S) -> Result<(), Error> {
    send(stream, &TYPE_BLOCK)?;
    let peer = read_block(stream)?;
    if peer.len() < TYPE_BLOCK_MIN {
        return Err(Error::DataSizes);
    }
    // size tags sit between the length byte and the trailing magic word;
    // compare as many as both sides declare
    let common = peer.len().min(TYPE_BLOCK.len()) - WORD - 1;
    if peer[1..1 + common] != TYPE_BLOCK[1..1 + common] {
        return Err(Error::DataSizes);
    }
    let magic = &peer[peer.len() - WORD..];
    let ours = &TYPE_BLOCK[TYPE_BLOCK.len() - WORD..];
    if magic == ours {
        Ok(())
    } else if magic.iter().eq(ours.iter().rev()) {
        Err(Error::ByteOrder)
    } else {
        Err(Error::Protocol)
    }
}

fn authorize<S: Read + Write>(stream: &mut S, auth_override: Option<&Path>) -> Result<(), Error> {
    match read_u32(stream)? {
        m if m == GO_MAGIC => return Ok(()),
        m if m == WAIT_MAGIC => {}
        _ => return Err(Error::Protocol),
    }

    let path = auth_path(auth_override).ok_or(Error::NoAuth)?;
    let secret = fs::read(&path).map_err(|e| {
        warn!("cannot read {}: {e}", path.display());
        Error::NoAuth
    })?;

    let challenge_len = read_u32(stream)? as usize;
    if secret.len() + challenge_len != CHALLENGE_TOTAL {
        return Err(Error::NoAuth);
    }
    let mut challenge = vec![0u8; challenge_len];
    read_exact(stream, &mut challenge)?;

    send(stream, &auth_digest(&secret, &challenge))?;
    match read_u32(stream)? {
        m if m == GO_MAGIC => Ok(()),
        _ => Err(Error::AuthDenied),
    }
}

fn auth_path(auth_override: Option<&Path>) -> Option<PathBuf> {
    match auth_override {
        Some(p) => Some(p.to_path_buf()),
        None => env::var_os("HOME").map(|home| PathBuf::from(home).join(AUTH_FILE)),
    }
}

/// Challenge response: MD5 over the secret followed by the server's
/// random bytes.
pub(crate) fn auth_digest(secret: &[u8], challenge: &[u8]) -> [u8; DIGEST_LEN] {
    let mut ctx = md5::Context::new();
    ctx.consume(secret);
    ctx.consume(challenge);
    ctx.compute().0
}
