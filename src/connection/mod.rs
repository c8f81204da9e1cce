//! Connection engine.
//!
//! # Overview
//!
//! [`Connection`] owns the socket to the display server and everything
//! that flows over it: the queue set, serial allocation, the listener
//! registry, and the optional compression codecs. It is shared by
//! reference across threads; all mutable state sits behind one mutex
//! ([`Core`]), and a condition variable coordinates the threads that
//! block on socket progress.
//!
//! # Locking
//!
//! Blocking syscalls never run under the lock. A thread that wants to
//! read or write claims the matching token (`reading` / `writing`) inside
//! the lock, releases the lock, performs the syscall, then re-acquires
//! the lock and gives the token back. Everything a thread believed before
//! the syscall must be re-checked afterwards: while it slept, other
//! threads may have consumed its reply, latched a failure, or enabled
//! compression.
//!
//! # Failure
//!
//! The first connection-fatal error latches a [`Fatal`] kind in the core,
//! clears all queues, shuts the socket down and wakes every blocked
//! thread. From then on every operation fails fast with an error derived
//! from the latched kind; the connection can only be dropped.

mod compress;
mod handshake;

use std::env;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};

use crate::error::{Error, Fatal};
use crate::event::{Event, Msg, Selector};
use crate::listener::{Handler, Listener, ListenerId, ListenerTree};
use crate::ops::{self, Arg, Op, OP_COUNT};
use crate::protocol::frame::{self, RequestBuilder, REPLY_HEADER};
use crate::protocol::{
    BASE_PORT, DISPLAY_ENV, FIND_OP_WIRE_ID, MSG_SERIAL, NO_ID, REPLY_FAIL, REPLY_OK,
    SOCKET_PATH_PREFIX, WORD,
};
use crate::queue::{QueueSet, Role};

use compress::GzipState;

const READ_CHUNK: usize = 8192;

/// Transport under the connection; both flavors allow reads and writes
/// through a shared reference, which the token scheme depends on.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).read(buf),
            Stream::Unix(s) => (&*s).read(buf),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).write(buf),
            Stream::Unix(s) => (&*s).write(buf),
        }
    }

    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn set_nonblocking(&self, nb: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nb),
            Stream::Unix(s) => s.set_nonblocking(nb),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// All mutable connection state, guarded by the one connection mutex.
struct Core {
    queues: QueueSet,
    serial: u32,
    gzip: Option<GzipState>,
    listeners: ListenerTree,
    fallback: Option<Handler>,
    panic: Option<Fatal>,
    reading: bool,
    writing: bool,
    op_ids: [Option<u32>; OP_COUNT],
}

impl Core {
    fn new() -> Self {
        Self {
            queues: QueueSet::new(),
            serial: 0,
            gzip: None,
            listeners: ListenerTree::new(),
            fallback: None,
            panic: None,
            reading: false,
            writing: false,
            op_ids: [None; OP_COUNT],
        }
    }

    /// Next request serial; the message marker value is never allocated.
    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == MSG_SERIAL {
            self.serial = self.serial.wrapping_add(1);
        }
        self.serial
    }

    fn deflate_outgoing(&mut self) -> Result<(), Fatal> {
        if let Some(g) = self.gzip.as_mut() {
            let (write, zwrite) = self.queues.write_pair_mut();
            g.deflate_queue(write, zwrite)
        } else {
            Ok(())
        }
    }

    fn inflate_incoming(&mut self) -> Result<(), Fatal> {
        if let Some(g) = self.gzip.as_mut() {
            let (zread, read) = self.queues.read_pair_mut();
            g.inflate_queue(zread, read)
        } else {
            Ok(())
        }
    }

    /// Scans freshly read bytes: messages move to the message queue,
    /// replies stay for their callers.
    fn sort_incoming(&mut self) {
        let (read, msg) = self.queues.read_msg_mut();
        frame::parse_replies(read, msg);
    }

    fn wire_role(&self) -> Role {
        if self.gzip.is_some() {
            Role::CompressedWrite
        } else {
            Role::Write
        }
    }
}

type Guard<'a> = MutexGuard<'a, Core>;

/// How the server was addressed, resolved from the display target string.
#[derive(Debug, PartialEq, Eq)]
enum Target {
    Unix(PathBuf),
    Tcp(String, u16),
}

/// Accepts `":N"` (unix socket `/tmp/.Twin:N`) and `"host:H"` (TCP to
/// `host`, port base plus hex `H`), each optionally suffixed with `,gz`
/// to request stream compression.
fn resolve_target(
    explicit: Option<&str>,
    from_env: Option<&str>,
) -> Result<(Target, bool), Error> {
    let target = explicit
        .or(from_env)
        .filter(|t| !t.is_empty())
        .ok_or(Error::NoDisplay)?;
    let (addr, gz) = match target.strip_suffix(",gz") {
        Some(s) => (s, true),
        None => (target, false),
    };
    if let Some(number) = addr.strip_prefix(':') {
        if number.is_empty() {
            return Err(Error::BadDisplay(target.to_owned()));
        }
        return Ok((
            Target::Unix(PathBuf::from(format!("{SOCKET_PATH_PREFIX}{addr}"))),
            gz,
        ));
    }
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(Error::BadDisplay(target.to_owned()));
    };
    if host.is_empty() || port.is_empty() {
        return Err(Error::BadDisplay(target.to_owned()));
    }
    let display = u16::from_str_radix(port, 16)
        .ok()
        .and_then(|d| BASE_PORT.checked_add(d))
        .ok_or_else(|| Error::BadDisplay(target.to_owned()))?;
    Ok((Target::Tcp(host.to_owned(), display), gz))
}

/// Raw answer of the display-attach operation, streamed outside the
/// normal frame traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachAnswer {
    /// Progress text to show the user.
    Text(Vec<u8>),
    /// Final verdict; nonzero means the display is up.
    Status(u8),
}

pub struct Connection {
    stream: Stream,
    core: Mutex<Core>,
    cond: Condvar,
    server_version: [u8; 3],
    exit_loop: AtomicBool,
}

impl Connection {
    /// Connects to the display named by `display`, or by the environment
    /// when `display` is `None`, and runs the handshake.
    pub fn open(display: Option<&str>) -> Result<Connection, Error> {
        let from_env = env::var(DISPLAY_ENV).ok();
        let (target, want_gz) = resolve_target(display, from_env.as_deref())?;
        debug!("connecting to {target:?}");
        let stream = match &target {
            Target::Unix(path) => {
                Stream::Unix(UnixStream::connect(path).map_err(Error::Connect)?)
            }
            Target::Tcp(host, port) => {
                Stream::Tcp(TcpStream::connect((host.as_str(), *port)).map_err(Error::Connect)?)
            }
        };
        let conn = Self::establish(stream, None)?;
        if want_gz {
            match conn.enable_compression() {
                Ok(true) => info!("stream compression enabled"),
                Ok(false) => debug!("server declined stream compression"),
                Err(e) => return Err(e),
            }
        }
        Ok(conn)
    }

    /// Handshakes on an already connected stream. `auth` overrides the
    /// location of the authorization secret.
    pub(crate) fn establish(mut stream: Stream, auth: Option<&Path>) -> Result<Connection, Error> {
        let server_version = handshake::run(&mut stream, auth)?;
        Ok(Connection {
            stream,
            core: Mutex::new(Core::new()),
            cond: Condvar::new(),
            server_version,
            exit_loop: AtomicBool::new(false),
        })
    }

    pub fn server_version(&self) -> [u8; 3] {
        self.server_version
    }

    /// Whether a fatal failure has been latched.
    pub fn in_panic(&self) -> bool {
        self.lock().panic.is_some()
    }

    /// The latched fatal failure, if any, as a fresh error value.
    pub fn last_error(&self) -> Option<Error> {
        self.lock().panic.map(Fatal::into_error)
    }

    fn lock(&self) -> Guard<'_> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: Guard<'a>) -> Guard<'a> {
        self.cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Latches a fatal failure. Idempotent: the first kind wins and is
    /// what every thread reports from then on.
    fn fail(&self, core: &mut Core, kind: Fatal) -> Error {
        if let Some(first) = core.panic {
            return first.into_error();
        }
        warn!("connection failed: {kind:?}");
        core.panic = Some(kind);
        core.queues.clear_all();
        self.stream.shutdown();
        self.cond.notify_all();
        kind.into_error()
    }

    fn latched(core: &Core) -> Result<(), Error> {
        match core.panic {
            Some(kind) => Err(kind.into_error()),
            None => Ok(()),
        }
    }

    /// Pulls bytes off the socket into the read queues. With `wait` the
    /// call blocks until at least one byte arrives; without it the socket
    /// is polled once. Returns the number of raw bytes received; zero
    /// from a non-blocking poll means nothing was pending, and zero from
    /// a blocking call means the read was cut short (another thread read
    /// on our behalf, or toggled the socket mode around its own poll)
    /// and the caller must re-check whatever it is waiting for.
    fn try_read<'a>(&'a self, mut core: Guard<'a>, wait: bool) -> (Guard<'a>, Result<usize, Error>) {
        if let Err(e) = Self::latched(&core) {
            return (core, Err(e));
        }
        if core.reading {
            if !wait {
                return (core, Ok(0));
            }
            core = self.wait(core);
            let verdict = Self::latched(&core).map(|()| 0);
            return (core, verdict);
        }
        core.reading = true;
        drop(core);

        if !wait {
            let _ = self.stream.set_nonblocking(true);
        }
        let mut buf = [0u8; READ_CHUNK];
        let got = self.stream.read(&mut buf);
        if !wait {
            let _ = self.stream.set_nonblocking(false);
        }

        let mut core = self.lock();
        core.reading = false;
        self.cond.notify_all();

        let n = match got {
            Ok(0) => {
                let e = self.fail(&mut core, Fatal::ConnectionLost);
                return (core, Err(e));
            }
            Ok(n) => n,
            // a concurrent non-waiting call can flip the shared socket
            // to non-blocking around its own syscall; a short read here
            // is "nothing yet", never an error, in either mode
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return (core, Ok(0));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return (core, Ok(0));
            }
            Err(_) => {
                let e = self.fail(&mut core, Fatal::ConnectionLost);
                return (core, Err(e));
            }
        };
        if let Err(e) = Self::latched(&core) {
            return (core, Err(e));
        }
        trace!("received {n} bytes");
        let landing = if core.gzip.is_some() {
            Role::CompressedRead
        } else {
            Role::Read
        };
        core.queues.get_mut(landing).append(&buf[..n]);
        if let Err(kind) = core.inflate_incoming() {
            let e = self.fail(&mut core, kind);
            return (core, Err(e));
        }
        (core, Ok(n))
    }

    /// Pushes queued outgoing bytes to the socket. With `wait` the call
    /// does not return until the queue is drained; without it, it writes
    /// what the socket accepts right now and leaves the rest queued.
    fn flush<'a>(&'a self, mut core: Guard<'a>, wait: bool) -> (Guard<'a>, Result<(), Error>) {
        if let Err(e) = Self::latched(&core) {
            return (core, Err(e));
        }
        if let Err(kind) = core.deflate_outgoing() {
            let e = self.fail(&mut core, kind);
            return (core, Err(e));
        }
        loop {
            while core.writing {
                if !wait {
                    return (core, Ok(()));
                }
                core = self.wait(core);
                if let Err(e) = Self::latched(&core) {
                    return (core, Err(e));
                }
            }
            let role = core.wire_role();
            let pending = core.queues.get(role).len();
            if pending == 0 {
                return (core, Ok(()));
            }
            let chunk = core.queues.get(role).view().to_vec();
            core.writing = true;
            drop(core);

            if !wait {
                let _ = self.stream.set_nonblocking(true);
            }
            let sent = self.stream.write(&chunk);
            if !wait {
                let _ = self.stream.set_nonblocking(false);
            }

            core = self.lock();
            core.writing = false;
            self.cond.notify_all();
            if let Err(e) = Self::latched(&core) {
                return (core, Err(e));
            }
            match sent {
                Ok(0) => {
                    let e = self.fail(&mut core, Fatal::Write(None));
                    return (core, Err(e));
                }
                Ok(n) => {
                    trace!("sent {n} of {} pending bytes", chunk.len());
                    core.queues.get_mut(role).consume_front(n);
                    if !wait {
                        return (core, Ok(()));
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    // same toggle race as on the read side; a draining
                    // flush just goes around again
                    if !wait {
                        return (core, Ok(()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let err = self.fail(&mut core, Fatal::write_error(&e));
                    return (core, Err(err));
                }
            }
        }
    }

    /// Drains the write queue and blocks until the reply carrying
    /// `serial` arrives; its payload (everything after the serial word)
    /// is extracted from the read queue and returned.
    fn wait_for_reply<'a>(
        &'a self,
        core: Guard<'a>,
        serial: u32,
    ) -> (Guard<'a>, Result<Vec<u8>, Error>) {
        let (mut core, flushed) = self.flush(core, true);
        if let Err(e) = flushed {
            return (core, Err(e));
        }
        loop {
            core.sort_incoming();
            if let Some((off, total)) = frame::find_reply(core.queues.get(Role::Read), serial) {
                let payload = core.queues.get(Role::Read).view()[off + REPLY_HEADER..off + total]
                    .to_vec();
                core.queues.get_mut(Role::Read).remove_span(off, total);
                return (core, Ok(payload));
            }
            let (c, got) = self.try_read(core, true);
            core = c;
            if let Err(e) = got {
                return (core, Err(e));
            }
        }
    }

    /// Resolves the wire id of `op`, asking the server once per
    /// connection and caching the answer, including negative ones.
    fn resolve_id<'a>(&'a self, mut core: Guard<'a>, op: Op) -> (Guard<'a>, Result<u32, Error>) {
        if op == Op::FindOp {
            return (core, Ok(FIND_OP_WIRE_ID));
        }
        if let Some(id) = core.op_ids[op as usize] {
            let verdict = if id == NO_ID {
                Err(Error::NoSuchOp(op.name()))
            } else {
                Ok(id)
            };
            return (core, verdict);
        }

        let d = op.descriptor();
        let serial = core.next_serial();
        {
            let q = core.queues.get_mut(Role::Write);
            let mut b = RequestBuilder::new(q);
            match ops::encode_args(
                Op::FindOp,
                &[Arg::Bytes(d.name.as_bytes()), Arg::Bytes(d.args.as_bytes())],
                &mut b,
            ) {
                Ok(()) => b.finish(serial, FIND_OP_WIRE_ID),
                Err(e) => {
                    b.abort();
                    return (core, Err(e));
                }
            }
        }
        let (mut core, reply) = self.wait_for_reply(core, serial);
        let payload = match reply {
            Ok(p) => p,
            Err(e) => return (core, Err(e)),
        };
        let id = match parse_status(&payload, op.name()) {
            Ok(data) if data.len() >= WORD => {
                u32::from_le_bytes([data[0], data[1], data[2], data[3]])
            }
            Ok(_) => return (core, Err(Error::StrangeReply(op.name()))),
            Err(e) => return (core, Err(e)),
        };
        core.op_ids[op as usize] = Some(id);
        if id == NO_ID {
            debug!("server does not implement {}", op.name());
            (core, Err(Error::NoSuchOp(op.name())))
        } else {
            trace!("{} resolved to wire id {id}", op.name());
            (core, Ok(id))
        }
    }

    /// Issues one remote operation. Replying operations block until the
    /// reply arrives and return its data; fire-and-forget operations are
    /// queued, opportunistically flushed, and return empty data.
    pub fn call(&self, op: Op, args: &[Arg<'_>]) -> Result<Vec<u8>, Error> {
        let core = self.lock();
        let (_core, verdict) = self.call_locked(core, op, args);
        verdict
    }

    fn call_locked<'a>(
        &'a self,
        core: Guard<'a>,
        op: Op,
        args: &[Arg<'_>],
    ) -> (Guard<'a>, Result<Vec<u8>, Error>) {
        if let Err(e) = Self::latched(&core) {
            return (core, Err(e));
        }
        let (mut core, id) = self.resolve_id(core, op);
        let id = match id {
            Ok(id) => id,
            Err(e) => return (core, Err(e)),
        };
        let serial = core.next_serial();
        {
            let q = core.queues.get_mut(Role::Write);
            let mut b = RequestBuilder::new(q);
            match ops::encode_args(op, args, &mut b) {
                Ok(()) => b.finish(serial, id),
                Err(e) => {
                    b.abort();
                    return (core, Err(e));
                }
            }
        }
        if !op.descriptor().reply {
            let (core, flushed) = self.flush(core, false);
            return (core, flushed.map(|()| Vec::new()));
        }
        let (core, reply) = self.wait_for_reply(core, serial);
        let verdict = reply.and_then(|payload| parse_status(&payload, op.name()).map(<[u8]>::to_vec));
        (core, verdict)
    }

    /// Blocks until the write queue fully reaches the socket and the
    /// server confirms it processed everything before this point.
    pub fn sync(&self) -> Result<(), Error> {
        self.call(Op::Sync, &[]).map(drop)
    }

    pub fn stat(&self, object: u32, fields: &[u8]) -> Result<Vec<u8>, Error> {
        self.call(Op::Stat, &[Arg::W(object), Arg::Bytes(fields)])
    }

    pub fn change_field(
        &self,
        object: u32,
        field: u32,
        clear_mask: u32,
        xor_mask: u32,
    ) -> Result<(), Error> {
        self.call(
            Op::ChangeField,
            &[
                Arg::W(object),
                Arg::W(field),
                Arg::W(clear_mask),
                Arg::W(xor_mask),
            ],
        )
        .map(drop)
    }

    pub fn send_msg(&self, port: u32, data: &[u8]) -> Result<(), Error> {
        self.call(Op::SendMsg, &[Arg::W(port), Arg::Bytes(data)])
            .map(drop)
    }

    /// Negotiates transparent stream compression. `Ok(false)` means the
    /// server declined; the connection continues uncompressed.
    pub fn enable_compression(&self) -> Result<bool, Error> {
        let can = self.call(Op::CanCompress, &[])?;
        if can.first().copied().unwrap_or(0) == 0 {
            return Ok(false);
        }
        let done = self.call(Op::DoCompress, &[Arg::B(1)])?;
        if done.first().copied().unwrap_or(0) == 0 {
            return Ok(false);
        }
        // everything the server sends after this reply is compressed
        let mut core = self.lock();
        core.gzip = Some(GzipState::new());
        Ok(true)
    }

    pub fn disable_compression(&self) -> Result<(), Error> {
        let done = self.call(Op::DoCompress, &[Arg::B(0)])?;
        if done.first().copied().unwrap_or(0) == 0 {
            return Err(Error::StrangeReply(Op::DoCompress.name()));
        }
        let mut core = self.lock();
        core.gzip = None;
        core.queues.get_mut(Role::CompressedRead).clear();
        core.queues.get_mut(Role::CompressedWrite).clear();
        Ok(())
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.lock().listeners.insert(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(id)
    }

    /// Handler for messages no registered listener matches.
    pub fn set_fallback(&self, handler: Option<Handler>) {
        self.lock().fallback = handler;
    }

    /// Whether a decoded message is already waiting.
    pub fn pending_msg(&self) -> bool {
        let mut core = self.lock();
        core.sort_incoming();
        frame::peek_msg(core.queues.get(Role::Msg)).is_some()
    }

    /// Next message without consuming it.
    pub fn peek_msg(&self) -> Option<Msg> {
        let mut core = self.lock();
        core.sort_incoming();
        let (mtype, body, _) = frame::peek_msg(core.queues.get(Role::Msg))?;
        decode_entry(mtype, body)
    }

    /// Next message, consumed. With `wait` the call blocks until one
    /// arrives or the connection dies; without it, the socket is polled
    /// once and `None` means no message is pending.
    pub fn read_msg(&self, wait: bool) -> Result<Option<Msg>, Error> {
        let core = self.lock();
        // push out anything queued, so the server has a reason to answer
        let (mut core, flushed) = self.flush(core, false);
        flushed?;
        loop {
            core.sort_incoming();
            if let Some((mtype, body, padded)) =
                frame::peek_msg(core.queues.get(Role::Msg)).map(|(t, b, p)| (t, b.to_vec(), p))
            {
                core.queues.get_mut(Role::Msg).consume(padded);
                match decode_entry(mtype, &body) {
                    Some(msg) => return Ok(Some(msg)),
                    None => continue,
                }
            }
            let (c, got) = self.try_read(core, wait);
            core = c;
            match got {
                Ok(0) if !wait => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs `msg` through the listener registry; the handler executes
    /// with the connection lock released, so it may issue calls and
    /// manage listeners itself. Returns whether any handler ran.
    pub fn dispatch(&self, msg: &Msg) -> bool {
        let mut core = self.lock();
        let hit = core
            .listeners
            .find(&Selector::for_msg(msg))
            .and_then(|id| core.listeners.take_handler(id).map(|h| (id, h)));
        if let Some((id, mut handler)) = hit {
            drop(core);
            handler(self, msg);
            self.lock().listeners.restore_handler(id, handler);
            return true;
        }
        let Some(mut fallback) = core.fallback.take() else {
            return false;
        };
        drop(core);
        fallback(self, msg);
        let mut core = self.lock();
        if core.fallback.is_none() {
            core.fallback = Some(fallback);
        }
        true
    }

    /// Receives and dispatches messages until [`Connection::exit_main_loop`]
    /// is called or the connection dies.
    pub fn main_loop(&self) -> Result<(), Error> {
        self.exit_loop.store(false, Ordering::Relaxed);
        loop {
            if self.exit_loop.load(Ordering::Relaxed) {
                return Ok(());
            }
            if let Some(msg) = self.read_msg(true)? {
                self.dispatch(&msg);
            }
        }
    }

    /// Makes [`Connection::main_loop`] return after the message it is
    /// currently handling. Callable from a handler.
    pub fn exit_main_loop(&self) {
        self.exit_loop.store(true, Ordering::Relaxed);
    }

    /// Asks the server to attach a new display driver described by
    /// `args`. The outcome arrives through [`Connection::attach_answer`].
    pub fn attach(&self, args: &[u8]) -> Result<(), Error> {
        self.call(Op::AttachDisplay, &[Arg::Bytes(args)])?;
        let core = self.lock();
        let (_core, flushed) = self.flush(core, true);
        flushed
    }

    /// One unit of the attach answer stream: either a chunk of progress
    /// text or the final status. The stream is raw bytes, not frames;
    /// text runs up to the first NUL, and a NUL in first position is
    /// followed by the status byte.
    pub fn attach_answer(&self) -> Result<AttachAnswer, Error> {
        let mut core = self.lock();
        // the answer arrives outside the codec even when the rest of
        // the traffic is compressed
        let codec = core.gzip.take();
        let answer = loop {
            let view = core.queues.get(Role::Read).view();
            if !view.is_empty() {
                if view[0] != 0 {
                    let end = view
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(view.len());
                    let text = view[..end].to_vec();
                    core.queues.get_mut(Role::Read).consume_front(end);
                    break Ok(AttachAnswer::Text(text));
                }
                if view.len() >= 2 {
                    let status = view[1];
                    core.queues.get_mut(Role::Read).consume_front(2);
                    break Ok(AttachAnswer::Status(status));
                }
            }
            let (c, got) = self.try_read(core, true);
            core = c;
            if let Err(e) = got {
                break Err(e);
            }
        };
        if let Some(state) = codec {
            core.gzip = Some(state);
        }
        answer
    }

    /// Confirms a successful attach so the server keeps the new display.
    pub fn attach_confirm(&self) -> Result<(), Error> {
        let mut core = self.lock();
        while core.writing {
            core = self.wait(core);
            if let Err(e) = Self::latched(&core) {
                return Err(e);
            }
        }
        core.writing = true;
        drop(core);
        let sent = self.stream.write_all(&[1]);
        let mut core = self.lock();
        core.writing = false;
        self.cond.notify_all();
        match sent {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(&mut core, Fatal::write_error(&e))),
        }
    }

    pub fn detach(&self) -> Result<(), Error> {
        self.call(Op::DetachDisplay, &[]).map(drop)
    }

    /// Flushes pending output and shuts the connection down, dropping
    /// every registered listener. Equivalent to dropping the value.
    pub fn close(self) {}
}

impl Drop for Connection {
    fn drop(&mut self) {
        let core = self
            .core
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if core.panic.is_none() {
            // best-effort: push out whatever was queued
            if core.deflate_outgoing().is_ok() {
                let role = core.wire_role();
                let _ = self.stream.write_all(core.queues.get(role).view());
            }
        }
        self.stream.shutdown();
    }
}

/// Splits a reply payload into status word and data, mapping the two
/// rejection statuses to per-call errors.
fn parse_status<'a>(payload: &'a [u8], op: &'static str) -> Result<&'a [u8], Error> {
    if payload.len() < WORD {
        return Err(Error::StrangeReply(op));
    }
    let status = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    match status {
        REPLY_OK => Ok(&payload[WORD..]),
        REPLY_FAIL => Err(Error::RejectedCall(op)),
        _ => Err(Error::RejectedArgs(op)),
    }
}

/// Decodes one message-queue entry; entries were validated structurally
/// on arrival, so failure here means a bug, not peer input.
fn decode_entry(mtype: u32, body: &[u8]) -> Option<Msg> {
    match Event::decode(mtype, body) {
        Ok(event) => Some(Msg { mtype, event }),
        Err(_) => {
            warn!("validated message entry failed to decode (type {mtype})");
            None
        }
    }
}
