//! Per-session pipes and signals linking the control loop to an adapter.
//!
//! Bytes from the client go into the in-pipe; the adapter reads them and
//! feeds the remote. The adapter writes remote bytes into the out-pipe (or
//! straight onto `out` for framed protocols). `window` carries resizes and
//! `ready` fires once when the adapter is connected.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

const PIPE_CAPACITY: usize = 64 * 1024;

/// "Teardown has begun." Closing is idempotent and only the first caller
/// wins.
#[derive(Debug, Default)]
pub struct Away {
    token: CancellationToken,
    closed: AtomicBool,
}

impl Away {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Largest terminal grid a session will allocate.
pub const MAX_COLS: u16 = 1000;
pub const MAX_ROWS: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u16,
    pub height: u16,
}

impl WindowSize {
    /// Client-reported size capped at `MAX_COLS` x `MAX_ROWS`. Zero stays
    /// zero so callers can still ignore it.
    pub fn clamped(width: u32, height: u32) -> Self {
        Self {
            width: width.min(u32::from(MAX_COLS)) as u16,
            height: height.min(u32::from(MAX_ROWS)) as u16,
        }
    }
}

/// Readiness signal, sent exactly once by the adapter.
pub struct Ready(Option<oneshot::Sender<Result<(), ApiError>>>);

impl Ready {
    pub fn ok(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(()));
        }
    }

    pub fn fail(&mut self, err: ApiError) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// The adapter's ends.
pub struct AdapterEnds {
    /// Client bytes to forward to the remote.
    pub input: DuplexStream,
    /// Remote bytes; a rune pump forwards them onto `out`.
    pub output: DuplexStream,
    /// Direct access to `out`, for framed protocols and banners.
    pub out_tx: mpsc::Sender<Vec<u8>>,
    pub window: mpsc::Receiver<WindowSize>,
    pub ready: Ready,
}

/// The control loop's ends.
pub struct ControlEnds {
    pub in_writer: DuplexStream,
    /// Read side of the adapter's out-pipe, drained by the rune pump.
    pub out_pipe: DuplexStream,
    pub out_rx: mpsc::Receiver<Vec<u8>>,
    pub window_tx: mpsc::Sender<WindowSize>,
    pub ready_rx: oneshot::Receiver<Result<(), ApiError>>,
}

pub fn session_channels() -> (ControlEnds, AdapterEnds) {
    let (in_writer, input) = duplex(PIPE_CAPACITY);
    let (output, out_pipe) = duplex(PIPE_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(1024);
    let (window_tx, window) = mpsc::channel(16);
    let (ready_tx, ready_rx) = oneshot::channel();
    (
        ControlEnds {
            in_writer,
            out_pipe,
            out_rx,
            window_tx,
            ready_rx,
        },
        AdapterEnds {
            input,
            output,
            out_tx,
            window,
            ready: Ready(Some(ready_tx)),
        },
    )
}
