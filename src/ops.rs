//! Remote operation descriptors.
//!
//! Every remote operation the engine can issue is described by one
//! [`OpDescriptor`]: its wire name, a signature string, and whether the
//! server sends a reply. A single generic invocation path encodes any
//! argument list against the signature; there is no per-operation stub
//! code.
//!
//! Signature characters:
//!
//! | char | argument |
//! |------|----------|
//! | `b`  | unsigned byte |
//! | `s`  | 16-bit word |
//! | `w`  | 32-bit word |
//! | `V`  | byte array, length-prefixed on the wire |
//! | `v`  | byte run, written verbatim (fixed shape) |
//!
//! Wire ids for these operations are not fixed: except for the lookup
//! operation itself, each id is resolved at run time by sending the
//! operation's name and signature through [`Op::FindOp`] and caching the
//! answer per connection.

use crate::error::Error;
use crate::protocol::frame::RequestBuilder;

#[derive(Debug, Clone, Copy)]
pub struct OpDescriptor {
    pub name: &'static str,
    /// Signature the server must agree to, one char per argument.
    pub args: &'static str,
    /// Operations without a reply are fire-and-forget.
    pub reply: bool,
}

/// Indexes into [`DESCRIPTORS`]; also the index of the per-connection
/// resolved-id cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Op {
    FindOp,
    Sync,
    Stat,
    ChangeField,
    SendMsg,
    CanCompress,
    DoCompress,
    AttachDisplay,
    DetachDisplay,
    SetSelectionOwner,
    RequestSelection,
    NotifySelection,
}

pub const OP_COUNT: usize = 12;

pub static DESCRIPTORS: [OpDescriptor; OP_COUNT] = [
    OpDescriptor { name: "FindFunction", args: "VV", reply: true },
    OpDescriptor { name: "SyncSocket", args: "", reply: true },
    OpDescriptor { name: "StatObj", args: "wV", reply: true },
    OpDescriptor { name: "ChangeFieldObj", args: "wwww", reply: false },
    OpDescriptor { name: "SendToMsgPort", args: "wV", reply: false },
    OpDescriptor { name: "CanCompress", args: "", reply: true },
    OpDescriptor { name: "DoCompress", args: "b", reply: true },
    // the attach outcome arrives as a raw byte stream, not a framed reply
    OpDescriptor { name: "AttachHW", args: "V", reply: false },
    OpDescriptor { name: "DetachHW", args: "", reply: false },
    OpDescriptor { name: "SetOwnerSelection", args: "ww", reply: false },
    OpDescriptor { name: "RequestSelection", args: "ww", reply: false },
    OpDescriptor { name: "NotifySelection", args: "wwvV", reply: false },
];

impl Op {
    pub fn descriptor(self) -> &'static OpDescriptor {
        &DESCRIPTORS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

/// One argument of a remote call. Lifetimes tie byte arguments to the
/// caller's buffers; nothing is copied until encoding.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    B(u8),
    S(u16),
    W(u32),
    /// Length-prefixed on the wire.
    Bytes(&'a [u8]),
    /// Written verbatim, the shape is fixed by the signature.
    Raw(&'a [u8]),
}

/// Encodes `args` against the operation signature into the open request
/// frame. Any shape mismatch aborts with [`Error::BadArgs`] before a
/// single byte is committed past the builder.
pub fn encode_args(
    op: Op,
    args: &[Arg<'_>],
    out: &mut RequestBuilder<'_>,
) -> Result<(), Error> {
    let sig = op.descriptor().args;
    if sig.len() != args.len() {
        return Err(Error::BadArgs(op.name()));
    }
    for (kind, arg) in sig.chars().zip(args) {
        match (kind, arg) {
            ('b', Arg::B(v)) => out.put_u8(*v),
            ('s', Arg::S(v)) => out.put_u16(*v),
            ('w', Arg::W(v)) => out.put_u32(*v),
            ('V', Arg::Bytes(data)) => out.put_bytes(data),
            ('v', Arg::Raw(data)) => out.put_raw(data),
            _ => return Err(Error::BadArgs(op.name())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Queue, Role};

    #[test]
    fn signature_shape_is_enforced() {
        let mut q = Queue::new(Role::Write);

        let mut b = RequestBuilder::new(&mut q);
        let wrong_kind = encode_args(Op::DoCompress, &[Arg::W(1)], &mut b);
        assert!(matches!(wrong_kind, Err(Error::BadArgs("DoCompress"))));
        b.abort();

        let mut b = RequestBuilder::new(&mut q);
        let wrong_count = encode_args(Op::Stat, &[Arg::W(1)], &mut b);
        assert!(matches!(wrong_count, Err(Error::BadArgs("StatObj"))));
        b.abort();

        assert!(q.is_empty());
    }

    #[test]
    fn lookup_encodes_both_name_and_signature() {
        let mut q = Queue::new(Role::Write);
        let mut b = RequestBuilder::new(&mut q);
        let d = Op::Stat.descriptor();
        encode_args(
            Op::FindOp,
            &[Arg::Bytes(d.name.as_bytes()), Arg::Bytes(d.args.as_bytes())],
            &mut b,
        )
        .unwrap();
        b.finish(1, crate::protocol::FIND_OP_WIRE_ID);

        let v = q.view();
        let name_len = u32::from_le_bytes([v[12], v[13], v[14], v[15]]) as usize;
        assert_eq!(&v[16..16 + name_len], b"StatObj");
    }

    #[test]
    fn every_descriptor_signature_is_well_formed() {
        for d in &DESCRIPTORS {
            assert!(d.args.chars().all(|c| "bswVv".contains(c)), "{}", d.name);
        }
    }
}
