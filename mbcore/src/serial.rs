//! Serial Port Engine: owns a file descriptor to a character device and
//! serializes AT-command issuance, response parsing, unsolicited-notification
//! dispatch, echo suppression, byte pacing and backpressure reporting.
//!
//! Architecture note: a dedicated OS thread performs the actual blocking
//! `read(2)` calls against the raw fd (character devices are not pollable
//! through tokio's reactor without a platform serial crate) and forwards
//! bytes over an unbounded channel to a "pump" task local to the owning
//! event loop. The pump task is the single writer of `Inner::buffer` (the
//! spec's "ring buffer for accumulated bytes not yet consumed by parser")
//! and runs unsolicited dispatch against it on every read, independent of
//! whether a command is currently in flight. Writes happen directly on the
//! async task via `spawn_blocking`, since at most one command may be in
//! flight at a time anyway.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use regex::bytes::Regex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::at_parser::{self, Outcome};
use crate::error::{CoreError, Error, Result, SerialError};

bitflags::bitflags! {
    /// Role hints on an AT port. At most one Primary and at most one Ppp
    /// per modem instance; the selection policy lives in the collaborator
    /// that owns the modem object, not here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u8 {
        const PRIMARY = 0b0001;
        const SECONDARY = 0b0010;
        const PPP = 0b0100;
        const GPS_CONTROL = 0b1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Tty,
    Net,
    UsbMisc,
    Wwan,
    Wdm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    Unknown,
    Ignored,
    At,
    Qcdm,
    Qmi,
    Mbim,
    Gps,
    NetData,
    AudioData,
}

/// A cooperative cancellation token, checked at every suspension point
/// inside [`SerialPort::send`] and [`SerialPort::flash`].
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

pub type HandlerId = u64;

/// (compiled regex, callback). Handlers are checked in registration order
/// against accumulated bytes whenever the buffer grows; a match's byte
/// range is removed from the buffer.
struct UnsolicitedHandler {
    id: HandlerId,
    regex: Regex,
    callback: Rc<dyn Fn(&[u8])>,
}

struct ResponseCache {
    capacity: usize,
    entries: VecDeque<(Vec<u8>, String)>,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        ResponseCache {
            capacity,
            entries: VecDeque::new(),
        }
    }

    fn get(&mut self, request: &[u8]) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == request)?;
        let entry = self.entries.remove(pos).unwrap();
        let value = entry.1.clone();
        self.entries.push_front(entry);
        Some(value)
    }

    fn put(&mut self, request: Vec<u8>, response: String) {
        self.entries.retain(|(k, _)| k != &request);
        self.entries.push_front((request, response));
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct IoHandle {
    fd: RawFd,
    stop: Arc<AtomicBool>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
}

impl IoHandle {
    /// Opens the device and starts its reader thread, returning the handle
    /// plus the receiving end of the byte channel the reader thread feeds.
    /// The receiver is owned by the port's pump task for the lifetime of
    /// this open fd, not re-taken per command.
    fn open(
        device: &str,
        vtime_deciseconds: u8,
        forced_close_tx: broadcast::Sender<()>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|_| Error::Serial(SerialError::OpenFailedNoDevice))?;

        configure_termios(fd, vtime_deciseconds).map_err(|_| Error::Serial(SerialError::OpenFailed))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_stop = stop.clone();
        let device_tag = device.to_string();
        let reader_thread =
            std::thread::spawn(move || reader_loop(fd, reader_stop, tx, forced_close_tx, device_tag));

        Ok((
            IoHandle {
                fd,
                stop,
                reader_thread: Some(reader_thread),
            },
            rx,
        ))
    }

    fn close(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        let _ = unistd::close(self.fd);
    }
}

fn configure_termios(fd: RawFd, vtime_deciseconds: u8) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(fd)?;
    termios::cfmakeraw(&mut tio);
    let _ = termios::cfsetispeed(&mut tio, termios::BaudRate::B115200);
    let _ = termios::cfsetospeed(&mut tio, termios::BaudRate::B115200);
    tio.control_flags.insert(termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD);
    tio.control_flags.remove(termios::ControlFlags::CRTSCTS);
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime_deciseconds;
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)?;
    termios::tcflush(fd, termios::FlushArg::TCIOFLUSH)?;
    Ok(())
}

fn set_baud(fd: RawFd, baud: termios::BaudRate) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(fd)?;
    termios::cfsetispeed(&mut tio, baud)?;
    termios::cfsetospeed(&mut tio, baud)?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
}

fn reader_loop(
    fd: RawFd,
    stop: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    forced_close_tx: broadcast::Sender<()>,
    device_tag: String,
) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        match unistd::read(fd, &mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {
                std::thread::sleep(Duration::from_millis(20));
            }
            // The device node itself disappeared (e.g. unplugged) rather
            // than a transient read error: tell the owning task so it can
            // tear down without waiting on a port that will never answer.
            Err(e @ (nix::errno::Errno::ENODEV | nix::errno::Errno::EIO | nix::errno::Errno::EBADF)) => {
                warn!(device = %device_tag, error = %e, "serial device disappeared, forcing close");
                let _ = forced_close_tx.send(());
                return;
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

enum WaitOutcome {
    Changed,
    ChannelClosed,
    TimedOut,
    Cancelled,
}

struct Inner {
    device: String,
    kind: PortKind,
    open_count: u32,
    io: Option<IoHandle>,
    io_dead: bool,
    send_delay_us: u64,
    remove_echo: bool,
    connected: bool,
    handlers: Vec<UnsolicitedHandler>,
    pending_handlers: Vec<UnsolicitedHandler>,
    next_handler_id: HandlerId,
    /// Accumulated bytes not yet consumed by a command's parser. Written
    /// only by the pump task spawned in `open`/`attach_raw_fd_for_test`;
    /// drained by unsolicited dispatch and by `send`'s echo/parse logic.
    buffer: Vec<u8>,
    cache: ResponseCache,
    queue: VecDeque<u64>,
    next_command_id: u64,
    in_flight: bool,
    notify: Rc<Notify>,
    /// Signalled by the pump task whenever `buffer` changes (grows from a
    /// read, or shrinks from unsolicited dispatch), and when the channel
    /// it reads from closes. `send` waits on this instead of reading the
    /// byte channel itself.
    data_notify: Rc<Notify>,
    buffer_full_tx: broadcast::Sender<()>,
    buffer_full_threshold: usize,
    forced_close_tx: broadcast::Sender<()>,
}

/// Owns a file descriptor to a character device. Cloning a `SerialPort`
/// yields another handle to the same underlying state (probe engine and
/// modem object share one port); the open/close lifecycle is
/// reference-counted.
///
/// Not `Send`: a port belongs to exactly one event loop, driven from a
/// single task. Use `tokio::task::LocalSet` if that task must itself be
/// spawned rather than run on the runtime's main task; the port's pump
/// task (see `open`) is itself spawned with `spawn_local` and requires an
/// active `LocalSet`.
#[derive(Clone)]
pub struct SerialPort {
    inner: Rc<RefCell<Inner>>,
}

struct InFlightGuard<'a> {
    inner: &'a Rc<RefCell<Inner>>,
    id: u64,
    released: bool,
}

impl<'a> InFlightGuard<'a> {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut inner = self.inner.borrow_mut();
        inner.queue.retain(|&qid| qid != self.id);
        inner.in_flight = false;
        inner.notify.notify_waiters();
    }
}

impl<'a> Drop for InFlightGuard<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

impl SerialPort {
    pub fn new(device: impl Into<String>, kind: PortKind) -> Self {
        let (buffer_full_tx, _rx) = broadcast::channel(4);
        let (forced_close_tx, _rx) = broadcast::channel(4);
        SerialPort {
            inner: Rc::new(RefCell::new(Inner {
                device: device.into(),
                kind,
                open_count: 0,
                io: None,
                io_dead: false,
                send_delay_us: 0,
                remove_echo: true,
                connected: false,
                handlers: Vec::new(),
                pending_handlers: Vec::new(),
                next_handler_id: 1,
                buffer: Vec::new(),
                cache: ResponseCache::new(16),
                queue: VecDeque::new(),
                next_command_id: 1,
                in_flight: false,
                notify: Rc::new(Notify::new()),
                data_notify: Rc::new(Notify::new()),
                buffer_full_tx,
                buffer_full_threshold: 64 * 1024,
                forced_close_tx,
            })),
        }
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        self.inner.borrow_mut().cache = ResponseCache::new(capacity.max(8));
        self
    }

    pub fn device(&self) -> String {
        self.inner.borrow().device.clone()
    }

    pub fn kind(&self) -> PortKind {
        self.inner.borrow().kind
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().open_count > 0
    }

    /// Opens the fd if the reference count was 0; always increments the
    /// count. A fresh open also spawns the port's pump task, which drains
    /// the reader thread's byte channel into `Inner::buffer` and runs
    /// unsolicited dispatch on every read, whether or not a command is in
    /// flight. Must run inside a `LocalSet`.
    pub fn open(&self) -> Result<()> {
        let needs_open = self.inner.borrow().open_count == 0;
        if needs_open {
            let (device, forced_close_tx) = {
                let inner = self.inner.borrow();
                (inner.device.clone(), inner.forced_close_tx.clone())
            };
            debug!(device = %device, "opening serial port");
            match IoHandle::open(&device, 1, forced_close_tx) {
                Ok((io, rx)) => {
                    let mut inner = self.inner.borrow_mut();
                    inner.io = Some(io);
                    inner.io_dead = false;
                    drop(inner);
                    self.spawn_pump(rx);
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "failed to open serial port");
                    return Err(e);
                }
            }
        }
        self.inner.borrow_mut().open_count += 1;
        Ok(())
    }

    /// Spawns the standing pump task for this port: drains bytes from the
    /// reader thread into `Inner::buffer`, dispatches unsolicited handlers
    /// against it, and wakes `data_notify` — all independent of whether a
    /// command happens to be outstanding. Holds only a weak reference so
    /// it cannot keep the port alive past its last strong handle.
    fn spawn_pump(&self, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        tokio::task::spawn_local(async move {
            loop {
                match rx.recv().await {
                    Some(bytes) => {
                        let inner = match weak.upgrade() {
                            Some(i) => i,
                            None => return,
                        };
                        inner.borrow_mut().buffer.extend_from_slice(&bytes);
                        dispatch_unsolicited(&inner);
                        check_buffer_full(&inner);
                        inner.borrow().data_notify.notify_one();
                    }
                    None => {
                        if let Some(inner) = weak.upgrade() {
                            inner.borrow_mut().io_dead = true;
                            inner.borrow().data_notify.notify_one();
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Decrements the open count; closes the fd at 0. Best-effort, never
    /// fails.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.open_count == 0 {
            return;
        }
        inner.open_count -= 1;
        if inner.open_count == 0 {
            debug!(device = %inner.device, "closing serial port");
            if let Some(io) = inner.io.take() {
                io.close();
            }
            inner.cache.clear();
            inner.buffer.clear();
        }
    }

    pub fn set_send_delay(&self, micros: u64) {
        self.inner.borrow_mut().send_delay_us = micros;
    }

    pub fn set_remove_echo(&self, enabled: bool) {
        self.inner.borrow_mut().remove_echo = enabled;
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.borrow_mut().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    /// Subscribes to the advisory "buffer full" back-pressure signal.
    pub fn buffer_full_signal(&self) -> broadcast::Receiver<()> {
        self.inner.borrow().buffer_full_tx.subscribe()
    }

    /// Subscribes to the "forced close" signal, fired when the reader
    /// thread observes the device disappear (`ENODEV`/`EIO`/`EBADF`)
    /// rather than a transient read error. A port that emits this should
    /// be treated as gone; the caller is responsible for calling
    /// [`SerialPort::close`] and discarding the port.
    pub fn forced_close_signal(&self) -> broadcast::Receiver<()> {
        self.inner.borrow().forced_close_tx.subscribe()
    }

    /// Registers an unsolicited-notification handler. Visible starting at
    /// the *next* pump-task scan, never the one in progress.
    pub fn add_unsolicited(&self, regex: Regex, callback: impl Fn(&[u8]) + 'static) -> HandlerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_handler_id;
        inner.next_handler_id += 1;
        inner.pending_handlers.push(UnsolicitedHandler {
            id,
            regex,
            callback: Rc::new(callback),
        });
        id
    }

    pub fn remove_unsolicited(&self, id: HandlerId) {
        let mut inner = self.inner.borrow_mut();
        inner.handlers.retain(|h| h.id != id);
        inner.pending_handlers.retain(|h| h.id != id);
    }

    /// Sends `request` and waits for a terminal state. FIFO with respect
    /// to other queued commands on this port; at most one command is
    /// ever in flight.
    pub async fn send(
        &self,
        request: impl Into<Vec<u8>>,
        timeout: Duration,
        raw: bool,
        cached: bool,
        cancel: CancelToken,
    ) -> Result<String> {
        let request = request.into();

        if self.inner.borrow().connected {
            return Err(Error::Serial(SerialError::NotOpen));
        }
        if !self.is_open() {
            return Err(Error::Serial(SerialError::NotOpen));
        }

        if cached {
            if let Some(hit) = self.inner.borrow_mut().cache.get(&request) {
                return Ok(hit);
            }
        } else {
            self.inner.borrow_mut().cache.clear();
        }

        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_command_id;
            inner.next_command_id += 1;
            inner.queue.push_back(id);
            id
        };

        // Queued -> wait for our turn, honoring cancellation while queued.
        loop {
            if cancel.is_cancelled() {
                self.inner.borrow_mut().queue.retain(|&qid| qid != id);
                return Err(Error::Core(CoreError::Cancelled));
            }
            let (is_front, busy) = {
                let inner = self.inner.borrow();
                (inner.queue.front() == Some(&id), inner.in_flight)
            };
            if is_front && !busy {
                break;
            }
            let notify = self.inner.borrow().notify.clone();
            tokio::select! {
                _ = notify.notified() => {}
                _ = cancel.cancelled() => {
                    self.inner.borrow_mut().queue.retain(|&qid| qid != id);
                    return Err(Error::Core(CoreError::Cancelled));
                }
            }
        }

        self.inner.borrow_mut().in_flight = true;
        let mut guard = InFlightGuard {
            inner: &self.inner,
            id,
            released: false,
        };

        // Sending. Races the write itself against cancellation, so a
        // command cannot get stuck uncancellable mid-transmission.
        if let Err(e) = self.write_command(&request, &cancel).await {
            guard.release();
            return Err(e);
        }

        // AwaitingResponse.
        let deadline = Instant::now() + timeout;
        let mut echo_resolved = !self.inner.borrow().remove_echo;

        loop {
            if !echo_resolved {
                let mut inner = self.inner.borrow_mut();
                match echo_state(&request, &inner.buffer) {
                    EchoState::Stripped(consumed) => {
                        inner.buffer.drain(..consumed);
                        echo_resolved = true;
                    }
                    EchoState::Pending => {}
                    EchoState::NotEchoing => {
                        echo_resolved = true;
                    }
                }
            }

            if echo_resolved {
                if raw {
                    let has_bytes = !self.inner.borrow().buffer.is_empty();
                    if has_bytes {
                        let mut inner = self.inner.borrow_mut();
                        let payload = String::from_utf8_lossy(&inner.buffer).to_string();
                        inner.buffer.clear();
                        drop(inner);
                        guard.release();
                        return Ok(payload);
                    }
                } else {
                    let outcome = at_parser::parse(&self.inner.borrow().buffer);
                    match outcome {
                        Outcome::Completed { payload } => {
                            self.inner.borrow_mut().buffer.clear();
                            if cached {
                                self.inner.borrow_mut().cache.put(request.clone(), payload.clone());
                            }
                            guard.release();
                            return Ok(payload);
                        }
                        Outcome::Error { error } => {
                            self.inner.borrow_mut().buffer.clear();
                            guard.release();
                            return Err(error);
                        }
                        Outcome::ParseFailed => {
                            self.inner.borrow_mut().buffer.clear();
                            guard.release();
                            return Err(Error::Serial(SerialError::ParseFailed));
                        }
                        Outcome::Incomplete => {}
                    }
                }
            }

            match wait_for_buffer_change(&self.inner, &cancel, deadline).await {
                WaitOutcome::Changed => continue,
                WaitOutcome::ChannelClosed => {
                    guard.release();
                    return Err(Error::Serial(SerialError::SendFailed));
                }
                WaitOutcome::TimedOut => {
                    guard.release();
                    return Err(Error::Serial(SerialError::ResponseTimeout));
                }
                WaitOutcome::Cancelled => {
                    guard.release();
                    return Err(Error::Core(CoreError::Cancelled));
                }
            }
        }
    }

    async fn write_command(&self, request: &[u8], cancel: &CancelToken) -> Result<()> {
        let fd = match self.inner.borrow().io.as_ref() {
            Some(io) => io.fd,
            None => return Err(Error::Serial(SerialError::NotOpen)),
        };
        let device = self.inner.borrow().device.clone();
        let send_delay_us = self.inner.borrow().send_delay_us;

        if send_delay_us == 0 {
            let bytes = request.to_vec();
            let write_fut = tokio::task::spawn_blocking(move || unistd::write(fd, &bytes));
            tokio::select! {
                joined = write_fut => {
                    let result = joined.map_err(|_| Error::Serial(SerialError::SendFailed))?;
                    if let Err(e) = result {
                        warn!(device = %device, error = %e, "write to serial port failed");
                        return Err(Error::Serial(SerialError::SendFailed));
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(Error::Core(CoreError::Cancelled));
                }
            }
        } else {
            for &byte in request {
                if cancel.is_cancelled() {
                    return Err(Error::Core(CoreError::Cancelled));
                }
                let one = [byte];
                let write_fut = tokio::task::spawn_blocking(move || unistd::write(fd, &one));
                tokio::select! {
                    joined = write_fut => {
                        let result = joined.map_err(|_| Error::Serial(SerialError::SendFailed))?;
                        if let Err(e) = result {
                            warn!(device = %device, error = %e, "write to serial port failed");
                            return Err(Error::Serial(SerialError::SendFailed));
                        }
                    }
                    _ = cancel.cancelled() => {
                        return Err(Error::Core(CoreError::Cancelled));
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_micros(send_delay_us)) => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::Core(CoreError::Cancelled));
                    }
                }
            }
        }
        Ok(())
    }

    /// Temporarily lowers the baud rate to signal hang-up, then restores
    /// it. Spurious `NO CARRIER` and flash failures are absorbed when
    /// `ignore_errors` is set; any other error propagates.
    pub async fn flash(&self, delay: Duration, ignore_errors: bool) -> Result<()> {
        let device = self.inner.borrow().device.clone();
        let fd = match self.inner.borrow().io.as_ref() {
            Some(io) => io.fd,
            None => return Err(Error::Serial(SerialError::NotOpen)),
        };

        debug!(device = %device, "flashing serial port");

        let result = tokio::task::spawn_blocking(move || set_baud(fd, termios::BaudRate::B0))
            .await
            .map_err(|_| Error::Serial(SerialError::FlashFailed))?;
        if let Err(e) = result {
            if !ignore_errors {
                return Err(Error::Serial(SerialError::FlashFailed));
            }
            warn!(device = %device, error = %e, "flash baud drop failed, ignoring");
        }

        tokio::time::sleep(delay).await;

        let result = tokio::task::spawn_blocking(move || set_baud(fd, termios::BaudRate::B115200))
            .await
            .map_err(|_| Error::Serial(SerialError::FlashFailed))?;
        if let Err(e) = result {
            if !ignore_errors {
                return Err(Error::Serial(SerialError::FlashFailed));
            }
            warn!(device = %device, error = %e, "flash baud restore failed, ignoring");
        }

        // The pump task keeps draining the reader thread's channel into
        // `buffer` throughout the flash window (it is not gated on a
        // command being in flight), so anything the modem emitted during
        // the drop — typically a spurious NO CARRIER — has already landed
        // in `buffer` by now rather than sitting unread in the channel
        // where it would otherwise corrupt the next command's response.
        // Yield once so the pump task gets to run before the clear below,
        // in case its last read is still pending in this task queue.
        tokio::task::yield_now().await;

        self.inner.borrow_mut().buffer.clear();
        self.inner.borrow_mut().cache.clear();
        self.inner.borrow_mut().connected = false;

        Ok(())
    }
}

#[cfg(feature = "test-util")]
impl SerialPort {
    /// Attaches an already-connected file descriptor (e.g. one end of a
    /// `socketpair(2)`) in place of opening a real device path, for
    /// integration tests that drive the engine without a physical modem.
    /// Skips termios configuration, since pipes and sockets don't support
    /// it. Spawns the same standing pump task as a real `open()`; requires
    /// an active `LocalSet`.
    pub fn attach_raw_fd_for_test(&self, fd: RawFd) {
        use nix::fcntl::FcntlArg;
        let _ = fcntl::fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK));

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_stop = stop.clone();
        let forced_close_tx = self.inner.borrow().forced_close_tx.clone();
        let reader_thread =
            std::thread::spawn(move || reader_loop(fd, reader_stop, tx, forced_close_tx, "test-fd".to_string()));

        {
            let mut inner = self.inner.borrow_mut();
            inner.io = Some(IoHandle {
                fd,
                stop,
                reader_thread: Some(reader_thread),
            });
            inner.io_dead = false;
            inner.open_count = 1;
        }
        self.spawn_pump(rx);
    }
}

fn try_strip_echo(sent: &[u8], buf: &[u8]) -> Option<usize> {
    if !buf.starts_with(sent) {
        return None;
    }
    let consumed = sent.len();
    let rest = &buf[consumed..];
    if rest.starts_with(b"\r\n") {
        Some(consumed + 2)
    } else if rest.starts_with(b"\r") {
        Some(consumed + 1)
    } else {
        Some(consumed)
    }
}

/// Whether the accumulated buffer still might be a growing echo of `sent`,
/// definitely is one (with a byte count to drain), or definitely is not.
/// A device that never echoes must not stall the response wait forever
/// waiting for a match that will never arrive.
enum EchoState {
    Stripped(usize),
    Pending,
    NotEchoing,
}

fn echo_state(sent: &[u8], buf: &[u8]) -> EchoState {
    if let Some(consumed) = try_strip_echo(sent, buf) {
        EchoState::Stripped(consumed)
    } else if buf.len() < sent.len() && sent.starts_with(buf) {
        EchoState::Pending
    } else {
        EchoState::NotEchoing
    }
}

/// Scans `inner`'s accumulated buffer against every registered handler,
/// draining a matched byte range out of the buffer before invoking its
/// callback. Called by the pump task on every read, so this runs whether
/// or not a command is currently in flight — a handler that never sees a
/// command outstanding still gets to observe purely unsolicited traffic.
fn dispatch_unsolicited(inner: &Rc<RefCell<Inner>>) {
    {
        let mut borrowed = inner.borrow_mut();
        if !borrowed.pending_handlers.is_empty() {
            let mut pending = std::mem::take(&mut borrowed.pending_handlers);
            borrowed.handlers.append(&mut pending);
        }
    }
    let handler_count = inner.borrow().handlers.len();

    for idx in 0..handler_count {
        loop {
            let matched_range = {
                let inner_ref = inner.borrow();
                let handler = match inner_ref.handlers.get(idx) {
                    Some(h) => h,
                    None => break,
                };
                handler.regex.find(&inner_ref.buffer).map(|m| (m.start(), m.end()))
            };
            match matched_range {
                Some((start, end)) => {
                    let matched_bytes = inner.borrow().buffer[start..end].to_vec();
                    let callback = {
                        let inner_ref = inner.borrow();
                        inner_ref.handlers.get(idx).map(|h| h.callback.clone())
                    };
                    inner.borrow_mut().buffer.drain(start..end);
                    if let Some(cb) = callback {
                        cb(&matched_bytes);
                    }
                }
                None => break,
            }
        }
    }
}

fn check_buffer_full(inner: &Rc<RefCell<Inner>>) {
    let inner_ref = inner.borrow();
    if inner_ref.buffer.len() >= inner_ref.buffer_full_threshold {
        let _ = inner_ref.buffer_full_tx.send(());
    }
}

/// Waits until the pump task signals that `inner`'s buffer has changed
/// (grown from a read, or shrunk from unsolicited dispatch), the port's
/// byte channel has closed, the deadline passes, or cancellation fires.
async fn wait_for_buffer_change(inner: &Rc<RefCell<Inner>>, cancel: &CancelToken, deadline: Instant) -> WaitOutcome {
    if inner.borrow().io_dead {
        return WaitOutcome::ChannelClosed;
    }
    if cancel.is_cancelled() {
        return WaitOutcome::Cancelled;
    }
    let notify = inner.borrow().data_notify.clone();
    tokio::select! {
        _ = notify.notified() => {
            if inner.borrow().io_dead {
                WaitOutcome::ChannelClosed
            } else {
                WaitOutcome::Changed
            }
        }
        _ = tokio::time::sleep_until(deadline) => WaitOutcome::TimedOut,
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_strip_with_crlf() {
        let sent = b"AT+CGMI\r";
        let buf = b"AT+CGMI\r\r\nTelit\r\n\r\nOK\r\n";
        let consumed = try_strip_echo(sent, buf).unwrap();
        assert_eq!(&buf[consumed..], b"\r\nTelit\r\n\r\nOK\r\n");
    }

    #[test]
    fn echo_strip_no_match() {
        assert!(try_strip_echo(b"AT\r", b"\r\nOK\r\n").is_none());
    }

    #[test]
    fn echo_state_detects_non_echoing_device() {
        // Buffer diverges from the sent bytes immediately: this device
        // doesn't echo, and the wait must not stall forever for one.
        assert!(matches!(echo_state(b"AT\r", b"\r\nOK\r\n"), EchoState::NotEchoing));
    }

    #[test]
    fn echo_state_waits_out_partial_echo() {
        assert!(matches!(echo_state(b"AT+CGMI\r", b"AT+CG"), EchoState::Pending));
    }

    #[test]
    fn echo_state_strips_full_echo() {
        assert!(matches!(echo_state(b"AT\r", b"AT\r\r\nOK\r\n"), EchoState::Stripped(_)));
    }

    #[test]
    fn response_cache_lru_eviction() {
        let mut cache = ResponseCache::new(2);
        cache.put(b"a".to_vec(), "1".into());
        cache.put(b"b".to_vec(), "2".into());
        cache.put(b"c".to_vec(), "3".into());
        assert!(cache.get(b"a").is_none());
        assert_eq!(cache.get(b"b").unwrap(), "2");
        assert_eq!(cache.get(b"c").unwrap(), "3");
    }

    #[test]
    fn cancel_token_reports_state() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn port_starts_closed() {
        let port = SerialPort::new("/dev/ttyFAKE0", PortKind::Tty);
        assert!(!port.is_open());
    }

    #[test]
    fn dispatch_unsolicited_runs_independent_of_in_flight_command() {
        // Exercises the pump-task code path directly against a bare
        // `Inner`, without a command ever being sent: bytes land in the
        // buffer and a matching handler fires purely from the "buffer
        // grew" trigger, per spec.md's normative unsolicited-dispatch
        // contract.
        let port = SerialPort::new("/dev/ttyFAKE1", PortKind::Tty);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        port.add_unsolicited(Regex::new(r"\r\n\+CREG: 1\r\n").unwrap(), move |bytes| {
            seen_cb.borrow_mut().extend_from_slice(bytes);
        });

        port.inner.borrow_mut().buffer.extend_from_slice(b"\r\n+CREG: 1\r\n");
        dispatch_unsolicited(&port.inner);

        assert_eq!(&*seen.borrow(), b"\r\n+CREG: 1\r\n");
        assert!(port.inner.borrow().buffer.is_empty());
    }
}
