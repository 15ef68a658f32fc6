// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-size request/response transfers over a pair of XDMA streaming
//! channels.
//!
//! A [`HardwareContext`] owns a page-aligned output buffer, a page-aligned
//! input buffer, and the host-to-card (H2C) and card-to-host (C2H) channels.
//! Each [`run`](HardwareContext::run) sends the first `output_size` bytes of
//! the output buffer and then receives exactly `input_size` bytes into the
//! input buffer.

#![cfg(unix)]
// UNSAFETY: Allocating transfer buffers with mmap.
#![expect(unsafe_code)]

mod backend;
mod buffer;
mod transfer;

pub use backend::XdmaBackend;
pub use backend::XdmaDevice;
pub use backend::DEFAULT_C2H_PATH;
pub use backend::DEFAULT_H2C_PATH;
pub use buffer::PageBuffer;

use std::fmt;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::time::Instant;
use thiserror::Error;

/// A step of context initialization, in acquisition order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitStep {
    OutputBuffer,
    InputBuffer,
    OpenH2c,
    OpenC2h,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            InitStep::OutputBuffer => "allocate output buffer",
            InitStep::InputBuffer => "allocate input buffer",
            InitStep::OpenH2c => "open h2c channel",
            InitStep::OpenC2h => "open c2h channel",
        })
    }
}

/// Error creating a [`HardwareContext`]. Nothing acquired before the failing
/// step is left behind.
#[derive(Debug, Error)]
#[error("failed to {step}")]
pub struct InitError {
    step: InitStep,
    #[source]
    source: std::io::Error,
}

impl InitError {
    /// The step that failed.
    pub fn step(&self) -> InitStep {
        self.step
    }
}

/// A direction of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Send,
    Receive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Phase::Send => "send",
            Phase::Receive => "receive",
        })
    }
}

/// Error running a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{phase} of {requested} bytes exceeds the {capacity} byte buffer")]
    Oversized {
        phase: Phase,
        requested: usize,
        capacity: usize,
    },
    #[error("send failed after {transferred} of {total} bytes")]
    Send {
        transferred: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("receive failed after {transferred} of {total} bytes")]
    Receive {
        transferred: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("{phase} timed out after {transferred} bytes")]
    TimedOut { phase: Phase, transferred: usize },
}

/// A context for exchanging fixed-size packets with an XDMA device.
pub struct HardwareContext<B: XdmaBackend = XdmaDevice> {
    // Fields are in reverse acquisition order so that they are released
    // in reverse.
    c2h: B::C2h,
    h2c: B::H2c,
    input: B::Buffer,
    output: B::Buffer,
}

impl HardwareContext<XdmaDevice> {
    /// Creates a context on the default XDMA channels with an `input_size`
    /// byte receive buffer and an `output_size` byte send buffer.
    pub fn initialize(input_size: usize, output_size: usize) -> Result<Self, InitError> {
        Self::initialize_with(&mut XdmaDevice::default(), input_size, output_size)
    }
}

impl<B: XdmaBackend> HardwareContext<B> {
    /// Creates a context from `backend`'s resources.
    pub fn initialize_with(
        backend: &mut B,
        input_size: usize,
        output_size: usize,
    ) -> Result<Self, InitError> {
        let fail = |step| move |source| InitError { step, source };

        let output = alloc(backend, output_size).map_err(fail(InitStep::OutputBuffer))?;
        let input = alloc(backend, input_size).map_err(fail(InitStep::InputBuffer))?;
        let h2c = backend.open_h2c().map_err(fail(InitStep::OpenH2c))?;
        let c2h = backend.open_c2h().map_err(fail(InitStep::OpenC2h))?;

        tracing::debug!(input_size, output_size, "initialized xdma context");
        Ok(Self {
            c2h,
            h2c,
            input,
            output,
        })
    }

    /// The send buffer.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// The send buffer, for filling in the next request.
    pub fn output_mut(&mut self) -> &mut [u8] {
        &mut self.output
    }

    /// The receive buffer, holding the last response.
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Sends `output_size` bytes of the output buffer, then receives
    /// `input_size` bytes into the input buffer.
    pub fn run(&mut self, input_size: usize, output_size: usize) -> Result<(), TransferError> {
        self.run_inner(input_size, output_size, None)
    }

    /// Like [`run`](Self::run), but gives up once `deadline` has passed.
    ///
    /// The deadline is only checked between channel calls, so a call that
    /// blocks indefinitely is not interrupted.
    pub fn run_with_deadline(
        &mut self,
        input_size: usize,
        output_size: usize,
        deadline: Instant,
    ) -> Result<(), TransferError> {
        self.run_inner(input_size, output_size, Some(deadline))
    }

    fn run_inner(
        &mut self,
        input_size: usize,
        output_size: usize,
        deadline: Option<Instant>,
    ) -> Result<(), TransferError> {
        if output_size > self.output.len() {
            return Err(TransferError::Oversized {
                phase: Phase::Send,
                requested: output_size,
                capacity: self.output.len(),
            });
        }
        if input_size > self.input.len() {
            return Err(TransferError::Oversized {
                phase: Phase::Receive,
                requested: input_size,
                capacity: self.input.len(),
            });
        }

        let Self {
            c2h,
            h2c,
            input,
            output,
        } = self;

        transfer::pump(
            Phase::Send,
            output_size,
            deadline,
            ErrorKind::WriteZero,
            |offset| h2c.write(&output[offset..output_size]),
        )
        .map_err(|stalled| stalled.into_error(Phase::Send, output_size))?;

        transfer::pump(
            Phase::Receive,
            input_size,
            deadline,
            ErrorKind::UnexpectedEof,
            |offset| c2h.read(&mut input[offset..input_size]),
        )
        .map_err(|stalled| stalled.into_error(Phase::Receive, input_size))?;

        Ok(())
    }

    /// Releases the channels and buffers.
    pub fn close(self) {}
}

impl<B: XdmaBackend> Drop for HardwareContext<B> {
    fn drop(&mut self) {
        tracing::debug!(
            input_size = self.input.len(),
            output_size = self.output.len(),
            "closed xdma context"
        );
    }
}

fn alloc<B: XdmaBackend>(backend: &mut B, len: usize) -> std::io::Result<B::Buffer> {
    if len == 0 {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            "buffer length must be non-zero",
        ));
    }
    backend.alloc_buffer(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::cell::RefCell;
    use std::ops::Deref;
    use std::ops::DerefMut;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Event {
        Write(usize),
        Read(usize),
    }

    /// Counts the backend resources that are still alive.
    #[derive(Clone, Default)]
    struct Live(Rc<Cell<usize>>);

    impl Live {
        fn acquire(&self) -> Guard {
            self.0.set(self.0.get() + 1);
            Guard(self.0.clone())
        }

        fn count(&self) -> usize {
            self.0.get()
        }
    }

    struct Guard(Rc<Cell<usize>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.set(self.0.get() - 1);
        }
    }

    struct MockBuffer(Vec<u8>, Guard);

    impl Deref for MockBuffer {
        type Target = [u8];
        fn deref(&self) -> &[u8] {
            &self.0
        }
    }

    impl DerefMut for MockBuffer {
        fn deref_mut(&mut self) -> &mut [u8] {
            &mut self.0
        }
    }

    struct MockH2c {
        chunk: usize,
        /// Fails the call with this index.
        fail_call: Option<usize>,
        calls: usize,
        sent: Rc<RefCell<Vec<u8>>>,
        events: Rc<RefCell<Vec<Event>>>,
        _guard: Guard,
    }

    impl Write for MockH2c {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_call == Some(call) {
                return Err(std::io::Error::other("link down"));
            }
            let n = buf.len().min(self.chunk);
            self.sent.borrow_mut().extend_from_slice(&buf[..n]);
            self.events.borrow_mut().push(Event::Write(n));
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct MockC2h {
        chunk: usize,
        /// Fails the call with this index.
        fail_call: Option<usize>,
        calls: usize,
        data: Vec<u8>,
        pos: usize,
        events: Rc<RefCell<Vec<Event>>>,
        _guard: Guard,
    }

    impl Read for MockC2h {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_call == Some(call) {
                return Err(std::io::Error::other("link down"));
            }
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            self.events.borrow_mut().push(Event::Read(n));
            Ok(n)
        }
    }

    struct MockBackend {
        live: Live,
        fail_at: Option<InitStep>,
        buffers: usize,
        chunk: usize,
        fail_write: Option<usize>,
        fail_read: Option<usize>,
        response: Vec<u8>,
        sent: Rc<RefCell<Vec<u8>>>,
        events: Rc<RefCell<Vec<Event>>>,
    }

    impl MockBackend {
        fn new(chunk: usize) -> Self {
            Self {
                live: Live::default(),
                fail_at: None,
                buffers: 0,
                chunk,
                fail_write: None,
                fail_read: None,
                response: Vec::new(),
                sent: Default::default(),
                events: Default::default(),
            }
        }

        fn check(&self, step: InitStep) -> std::io::Result<()> {
            if self.fail_at == Some(step) {
                return Err(std::io::Error::other("injected failure"));
            }
            Ok(())
        }

        fn events(&self) -> Vec<Event> {
            self.events.borrow().clone()
        }
    }

    impl XdmaBackend for MockBackend {
        type Buffer = MockBuffer;
        type H2c = MockH2c;
        type C2h = MockC2h;

        fn alloc_buffer(&mut self, len: usize) -> std::io::Result<MockBuffer> {
            let step = if self.buffers == 0 {
                InitStep::OutputBuffer
            } else {
                InitStep::InputBuffer
            };
            self.check(step)?;
            self.buffers += 1;
            Ok(MockBuffer(vec![0; len], self.live.acquire()))
        }

        fn open_h2c(&mut self) -> std::io::Result<MockH2c> {
            self.check(InitStep::OpenH2c)?;
            Ok(MockH2c {
                chunk: self.chunk,
                fail_call: self.fail_write,
                calls: 0,
                sent: self.sent.clone(),
                events: self.events.clone(),
                _guard: self.live.acquire(),
            })
        }

        fn open_c2h(&mut self) -> std::io::Result<MockC2h> {
            self.check(InitStep::OpenC2h)?;
            Ok(MockC2h {
                chunk: self.chunk,
                fail_call: self.fail_read,
                calls: 0,
                data: self.response.clone(),
                pos: 0,
                events: self.events.clone(),
                _guard: self.live.acquire(),
            })
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn initialize_releases_everything_on_failure() {
        for step in [
            InitStep::OutputBuffer,
            InitStep::InputBuffer,
            InitStep::OpenH2c,
            InitStep::OpenC2h,
        ] {
            let mut backend = MockBackend::new(4096);
            backend.fail_at = Some(step);
            let err = HardwareContext::initialize_with(&mut backend, 64, 64)
                .err()
                .unwrap();
            assert_eq!(err.step(), step);
            assert_eq!(backend.live.count(), 0, "leaked resources at {step}");
        }
    }

    #[test]
    fn close_releases_everything() {
        let mut backend = MockBackend::new(4096);
        let ctx = HardwareContext::initialize_with(&mut backend, 64, 128).unwrap();
        assert_eq!(backend.live.count(), 4);
        assert_eq!(ctx.output().len(), 128);
        assert_eq!(ctx.input().len(), 64);
        ctx.close();
        assert_eq!(backend.live.count(), 0);
    }

    #[test]
    fn zero_sized_buffers_are_rejected() {
        let mut backend = MockBackend::new(4096);
        let err = HardwareContext::initialize_with(&mut backend, 64, 0)
            .err()
            .unwrap();
        assert_eq!(err.step(), InitStep::OutputBuffer);
        let err = HardwareContext::initialize_with(&mut backend, 0, 64)
            .err()
            .unwrap();
        assert_eq!(err.step(), InitStep::InputBuffer);
        assert_eq!(backend.live.count(), 0);
    }

    #[test]
    fn short_writes_accumulate() {
        let mut backend = MockBackend::new(4096);
        backend.response = vec![0; 8];
        let mut ctx = HardwareContext::initialize_with(&mut backend, 8, 10000).unwrap();
        let request = pattern(10000);
        ctx.output_mut().copy_from_slice(&request);
        ctx.run(8, 10000).unwrap();

        let writes: Vec<_> = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Write(_)))
            .collect();
        assert_eq!(
            writes,
            [Event::Write(4096), Event::Write(4096), Event::Write(1808)]
        );
        assert_eq!(*backend.sent.borrow(), request);
    }

    #[test]
    fn short_reads_accumulate() {
        let mut backend = MockBackend::new(1000);
        backend.response = pattern(2500);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 2500, 8).unwrap();
        ctx.run(2500, 8).unwrap();

        let reads: Vec<_> = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Read(_)))
            .collect();
        assert_eq!(reads, [Event::Read(1000), Event::Read(1000), Event::Read(500)]);
        assert_eq!(ctx.input(), &pattern(2500)[..]);
    }

    #[test]
    fn receive_starts_after_send_completes() {
        let mut backend = MockBackend::new(16);
        backend.response = pattern(64);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 64).unwrap();
        ctx.run(64, 64).unwrap();
        let events = backend.events();
        assert_eq!(events.len(), 8);
        assert!(events[..4].iter().all(|e| matches!(e, Event::Write(16))));
        assert!(events[4..].iter().all(|e| matches!(e, Event::Read(16))));
    }

    #[test]
    fn partial_sizes_use_the_buffer_prefix() {
        let mut backend = MockBackend::new(4096);
        backend.response = pattern(32);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 64).unwrap();
        ctx.output_mut().copy_from_slice(&pattern(64));
        ctx.run(32, 16).unwrap();
        assert_eq!(*backend.sent.borrow(), pattern(16));
        assert_eq!(&ctx.input()[..32], &pattern(32)[..]);
        assert!(ctx.input()[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn send_failure_skips_receive() {
        let mut backend = MockBackend::new(4096);
        backend.fail_write = Some(1);
        backend.response = pattern(64);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 10000).unwrap();
        let err = ctx.run(64, 10000).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Send {
                transferred: 4096,
                total: 10000,
                ..
            }
        ));
        assert!(!backend
            .events()
            .iter()
            .any(|e| matches!(e, Event::Read(_))));
        // The context stays usable.
        ctx.run(64, 16).unwrap();
    }

    #[test]
    fn truncated_response() {
        let mut backend = MockBackend::new(4096);
        backend.response = pattern(10);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 8).unwrap();
        match ctx.run(64, 8).unwrap_err() {
            TransferError::Receive {
                transferred,
                total,
                source,
            } => {
                assert_eq!((transferred, total), (10, 64));
                assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
            }
            err => panic!("unexpected error {err}"),
        }
    }

    #[test]
    fn receive_failure_is_reported() {
        let mut backend = MockBackend::new(16);
        backend.fail_read = Some(2);
        backend.response = pattern(96);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 8).unwrap();
        match ctx.run(64, 8).unwrap_err() {
            TransferError::Receive {
                transferred,
                total,
                source,
            } => {
                assert_eq!((transferred, total), (32, 64));
                assert_eq!(source.kind(), ErrorKind::Other);
                assert_eq!(source.to_string(), "link down");
            }
            err => panic!("unexpected error {err}"),
        }
        // The context stays usable and picks up where the channel left off.
        ctx.run(64, 8).unwrap();
        assert_eq!(ctx.input(), &pattern(96)[32..]);
        ctx.close();
        assert_eq!(backend.live.count(), 0);
    }

    #[test]
    fn oversized_runs_transfer_nothing() {
        let mut backend = MockBackend::new(4096);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 64).unwrap();
        assert!(matches!(
            ctx.run(64, 65),
            Err(TransferError::Oversized {
                phase: Phase::Send,
                requested: 65,
                capacity: 64,
            })
        ));
        assert!(matches!(
            ctx.run(65, 64),
            Err(TransferError::Oversized {
                phase: Phase::Receive,
                ..
            })
        ));
        assert!(backend.events().is_empty());
    }

    #[test]
    fn deadline() {
        let mut backend = MockBackend::new(4096);
        backend.response = pattern(64);
        let mut ctx = HardwareContext::initialize_with(&mut backend, 64, 64).unwrap();
        assert!(matches!(
            ctx.run_with_deadline(64, 64, Instant::now()),
            Err(TransferError::TimedOut {
                phase: Phase::Send,
                transferred: 0,
            })
        ));
        assert!(backend.events().is_empty());
        ctx.run_with_deadline(64, 64, Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert_eq!(ctx.input(), &pattern(64)[..]);
    }

    #[test]
    fn device_files() {
        let h2c = tempfile::NamedTempFile::new().unwrap();
        let c2h = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(c2h.path(), pattern(300)).unwrap();

        let mut device = XdmaDevice::new()
            .with_h2c_path(h2c.path())
            .with_c2h_path(c2h.path());
        let mut ctx = HardwareContext::initialize_with(&mut device, 300, 5000).unwrap();
        assert_eq!(ctx.output().as_ptr() as usize % 4096, 0);
        assert_eq!(ctx.input().as_ptr() as usize % 4096, 0);
        ctx.output_mut().copy_from_slice(&pattern(5000));
        ctx.run(300, 5000).unwrap();
        assert_eq!(ctx.input(), &pattern(300)[..]);
        ctx.close();

        assert_eq!(std::fs::read(h2c.path()).unwrap(), pattern(5000));
    }

    #[test]
    fn missing_device_files() {
        let c2h = tempfile::NamedTempFile::new().unwrap();
        let mut device = XdmaDevice::new()
            .with_h2c_path("/nonexistent/xdma0_h2c_0")
            .with_c2h_path(c2h.path());
        let err = HardwareContext::initialize_with(&mut device, 64, 64)
            .err()
            .unwrap();
        assert_eq!(err.step(), InitStep::OpenH2c);

        let h2c = tempfile::NamedTempFile::new().unwrap();
        let mut device = device
            .with_h2c_path(h2c.path())
            .with_c2h_path("/nonexistent/xdma0_c2h_0");
        let err = HardwareContext::initialize_with(&mut device, 64, 64)
            .err()
            .unwrap();
        assert_eq!(err.step(), InitStep::OpenC2h);
    }
}
