//! Asynchronous message payloads.
//!
//! Each message frame carries a type word followed by an event body.
//! [`Event`] is the closed set of decoded payload variants; a decoded,
//! owned `Event` is what listeners receive, so callbacks never alias the
//! message queue (which may be reallocated if the callback itself issues
//! a protocol call).
//!
//! The structural minimum length per type is enforced when a frame is
//! relocated to the message queue: frames shorter than their declared
//! shape, or whose declared variable-length field disagrees with the
//! actual body size, are discarded as malformed.

use crate::protocol::cursor::{Decoder, Truncated};

/// Object identifiers as the server hands them out. Zero is "no object"
/// (messages that do not originate from a widget use it).
pub type WidgetId = u32;

pub const NO_WIDGET: WidgetId = 0;

/// Message type tags.
pub mod msg_type {
    pub const DISPLAY: u32 = 1;
    pub const KEY: u32 = 2;
    pub const MOUSE: u32 = 3;
    pub const WIDGET_CHANGE: u32 = 4;
    pub const GADGET: u32 = 5;
    pub const MENU_ROW: u32 = 6;
    pub const SELECTION: u32 = 7;
    pub const SELECTION_NOTIFY: u32 = 8;
    pub const SELECTION_REQUEST: u32 = 9;
    pub const CONTROL: u32 = 10;
    pub const CLIENT: u32 = 11;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Remote display driver traffic: `code, len, x, y, data[len]`.
    Display {
        code: u16,
        x: u16,
        y: u16,
        data: Vec<u8>,
    },
    /// Key press: `widget, code, shift, seq_len, pad, seq[seq_len]`.
    Key {
        widget: WidgetId,
        code: u16,
        shift: u16,
        seq: Vec<u8>,
    },
    /// Mouse activity: `widget, code, shift, x, y`.
    Mouse {
        widget: WidgetId,
        code: u16,
        shift: u16,
        x: i16,
        y: i16,
    },
    /// Geometry/visibility change: `widget, code, flags, w, h, x, y`.
    WidgetChange {
        widget: WidgetId,
        code: u16,
        flags: u16,
        width: u16,
        height: u16,
        x: i16,
        y: i16,
    },
    /// Gadget activation: `widget, code, flags`.
    Gadget {
        widget: WidgetId,
        code: u16,
        flags: u16,
    },
    /// Menu row activation: `widget, code, pad, menu`.
    MenuRow {
        widget: WidgetId,
        code: u16,
        menu: u32,
    },
    /// Selection ownership request: `widget, code, pad, x, y`.
    Selection {
        widget: WidgetId,
        code: u16,
        x: i16,
        y: i16,
    },
    /// Selection content: `widget, code, pad, content_magic, len, data[len]`.
    SelectionNotify {
        widget: WidgetId,
        code: u16,
        content_magic: u32,
        data: Vec<u8>,
    },
    /// Peer asks us to produce the selection: `widget, code, pad, requestor`.
    SelectionRequest {
        widget: WidgetId,
        code: u16,
        requestor: u32,
    },
    /// Out-of-band control: `widget, code, len, x, y, data[len]`.
    Control {
        widget: WidgetId,
        code: u16,
        x: i16,
        y: i16,
        data: Vec<u8>,
    },
    /// Client-to-client message: `widget, code, format, len, data[len]`.
    Client {
        widget: WidgetId,
        code: u16,
        format: u16,
        data: Vec<u8>,
    },
}

/// One decoded asynchronous message: the raw type tag plus its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub mtype: u32,
    pub event: Event,
}

/// Structural minimum body length for a message type; `None` for tags
/// this engine does not know (such frames are malformed by definition).
pub(crate) fn min_body_len(mtype: u32) -> Option<usize> {
    Some(match mtype {
        msg_type::DISPLAY => 8,
        msg_type::KEY => 12,
        msg_type::MOUSE => 12,
        msg_type::WIDGET_CHANGE => 16,
        msg_type::GADGET => 8,
        msg_type::MENU_ROW => 12,
        msg_type::SELECTION => 12,
        msg_type::SELECTION_NOTIFY => 16,
        msg_type::SELECTION_REQUEST => 12,
        msg_type::CONTROL => 12,
        msg_type::CLIENT => 12,
        _ => return None,
    })
}

/// Declared length of the trailing variable-size field, for the types
/// that have one. The body is assumed to hold at least the minimum.
fn declared_extra(mtype: u32, body: &[u8]) -> usize {
    let mut d = Decoder::new(body);
    let extra = match mtype {
        msg_type::DISPLAY => d.u16().and_then(|_| d.u16()).map(usize::from),
        msg_type::KEY => d.skip(8).and_then(|_| d.u16()).map(usize::from),
        msg_type::SELECTION_NOTIFY => d
            .skip(12)
            .and_then(|_| d.u32())
            .map(|n| n as usize),
        msg_type::CONTROL => d.skip(6).and_then(|_| d.u16()).map(usize::from),
        msg_type::CLIENT => d.skip(8).and_then(|_| d.u32()).map(|n| n as usize),
        _ => Ok(0),
    };
    extra.unwrap_or(0)
}

/// Structural check applied before a frame is copied to the message
/// queue: known type, minimum length, and the declared variable-length
/// field must account for the body exactly.
pub(crate) fn frame_body_ok(mtype: u32, body: &[u8]) -> bool {
    let Some(min) = min_body_len(mtype) else {
        return false;
    };
    body.len() >= min && body.len() == min + declared_extra(mtype, body)
}

impl Event {
    pub fn decode(mtype: u32, body: &[u8]) -> Result<Event, Truncated> {
        let mut d = Decoder::new(body);
        Ok(match mtype {
            msg_type::DISPLAY => {
                let code = d.u16()?;
                let len = d.u16()? as usize;
                let x = d.u16()?;
                let y = d.u16()?;
                Event::Display {
                    code,
                    x,
                    y,
                    data: d.bytes(len)?.to_vec(),
                }
            }
            msg_type::KEY => {
                let widget = d.u32()?;
                let code = d.u16()?;
                let shift = d.u16()?;
                let len = d.u16()? as usize;
                d.skip(2)?; // pad
                Event::Key {
                    widget,
                    code,
                    shift,
                    seq: d.bytes(len)?.to_vec(),
                }
            }
            msg_type::MOUSE => Event::Mouse {
                widget: d.u32()?,
                code: d.u16()?,
                shift: d.u16()?,
                x: d.i16()?,
                y: d.i16()?,
            },
            msg_type::WIDGET_CHANGE => Event::WidgetChange {
                widget: d.u32()?,
                code: d.u16()?,
                flags: d.u16()?,
                width: d.u16()?,
                height: d.u16()?,
                x: d.i16()?,
                y: d.i16()?,
            },
            msg_type::GADGET => Event::Gadget {
                widget: d.u32()?,
                code: d.u16()?,
                flags: d.u16()?,
            },
            msg_type::MENU_ROW => {
                let widget = d.u32()?;
                let code = d.u16()?;
                d.skip(2)?;
                Event::MenuRow {
                    widget,
                    code,
                    menu: d.u32()?,
                }
            }
            msg_type::SELECTION => {
                let widget = d.u32()?;
                let code = d.u16()?;
                d.skip(2)?;
                Event::Selection {
                    widget,
                    code,
                    x: d.i16()?,
                    y: d.i16()?,
                }
            }
            msg_type::SELECTION_NOTIFY => {
                let widget = d.u32()?;
                let code = d.u16()?;
                d.skip(2)?;
                let content_magic = d.u32()?;
                let len = d.u32()? as usize;
                Event::SelectionNotify {
                    widget,
                    code,
                    content_magic,
                    data: d.bytes(len)?.to_vec(),
                }
            }
            msg_type::SELECTION_REQUEST => {
                let widget = d.u32()?;
                let code = d.u16()?;
                d.skip(2)?;
                Event::SelectionRequest {
                    widget,
                    code,
                    requestor: d.u32()?,
                }
            }
            msg_type::CONTROL => {
                let widget = d.u32()?;
                let code = d.u16()?;
                let len = d.u16()? as usize;
                let x = d.i16()?;
                let y = d.i16()?;
                Event::Control {
                    widget,
                    code,
                    x,
                    y,
                    data: d.bytes(len)?.to_vec(),
                }
            }
            msg_type::CLIENT => {
                let widget = d.u32()?;
                let code = d.u16()?;
                let format = d.u16()?;
                let len = d.u32()? as usize;
                Event::Client {
                    widget,
                    code,
                    format,
                    data: d.bytes(len)?.to_vec(),
                }
            }
            _ => return Err(Truncated),
        })
    }

    pub fn widget(&self) -> WidgetId {
        match *self {
            Event::Display { .. } => NO_WIDGET,
            Event::Key { widget, .. }
            | Event::Mouse { widget, .. }
            | Event::WidgetChange { widget, .. }
            | Event::Gadget { widget, .. }
            | Event::MenuRow { widget, .. }
            | Event::Selection { widget, .. }
            | Event::SelectionNotify { widget, .. }
            | Event::SelectionRequest { widget, .. }
            | Event::Control { widget, .. }
            | Event::Client { widget, .. } => widget,
        }
    }

    pub fn code(&self) -> u16 {
        match *self {
            Event::Display { code, .. }
            | Event::Key { code, .. }
            | Event::Mouse { code, .. }
            | Event::WidgetChange { code, .. }
            | Event::Gadget { code, .. }
            | Event::MenuRow { code, .. }
            | Event::Selection { code, .. }
            | Event::SelectionNotify { code, .. }
            | Event::SelectionRequest { code, .. }
            | Event::Control { code, .. }
            | Event::Client { code, .. } => code,
        }
    }
}

/// Type-specific secondary match fields of a subscription: keyboard and
/// mouse subscriptions match exact modifier flags, menu subscriptions an
/// exact menu identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Detail {
    None,
    Shift(u16),
    Menu(u32),
}

/// Composite key a listener subscribes under, and the probe derived from
/// an incoming message during dispatch. The derived `Ord` gives the
/// deterministic total order the dispatch tree balances by; the order
/// itself carries no meaning beyond exact-match lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Selector {
    pub mtype: u32,
    pub widget: WidgetId,
    pub code: u16,
    pub detail: Detail,
}

impl Selector {
    /// Scalar hash the dispatch tree is keyed by; collisions fall back to
    /// the full `Ord` comparison.
    pub(crate) fn tree_key(&self) -> u32 {
        (self.mtype << 5) ^ self.widget ^ ((self.code as u32) << 16)
    }

    /// The selector an incoming message must match exactly.
    pub fn for_msg(msg: &Msg) -> Selector {
        let detail = match msg.event {
            Event::Key { shift, .. } | Event::Mouse { shift, .. } => Detail::Shift(shift),
            Event::MenuRow { menu, .. } => Detail::Menu(menu),
            _ => Detail::None,
        };
        Selector {
            mtype: msg.mtype,
            widget: msg.event.widget(),
            code: msg.event.code(),
            detail,
        }
    }
}
