//! Stop codes and the shared stop signal of one attempt

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why an attempt or session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopCode {
    /// Clean exit
    Normal,
    /// Protocol-level failure
    GeneralError,
    /// Another attempt won the race
    ConcurrentSession,
    /// The link stalled for too long
    ConnectionTimeout,
    /// Exit code reported by the remote process
    Exit(i32),
}

impl StopCode {
    pub const GENERAL_ERROR: i32 = 1000;
    pub const CONCURRENT_SESSION: i32 = 1001;
    pub const CONNECTION_TIMEOUT: i32 = 1002;

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StopCode::Normal,
            Self::GENERAL_ERROR => StopCode::GeneralError,
            Self::CONCURRENT_SESSION => StopCode::ConcurrentSession,
            Self::CONNECTION_TIMEOUT => StopCode::ConnectionTimeout,
            other => StopCode::Exit(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            StopCode::Normal => 0,
            StopCode::GeneralError => Self::GENERAL_ERROR,
            StopCode::ConcurrentSession => Self::CONCURRENT_SESSION,
            StopCode::ConnectionTimeout => Self::CONNECTION_TIMEOUT,
            StopCode::Exit(code) => code,
        }
    }
}

impl fmt::Display for StopCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCode::Normal => write!(f, "normal exit"),
            StopCode::GeneralError => write!(f, "general error ({})", Self::GENERAL_ERROR),
            StopCode::ConcurrentSession => {
                write!(f, "concurrent session ({})", Self::CONCURRENT_SESSION)
            }
            StopCode::ConnectionTimeout => {
                write!(f, "connection timeout ({})", Self::CONNECTION_TIMEOUT)
            }
            StopCode::Exit(code) => write!(f, "exit code {code}"),
        }
    }
}

/// Clonable stop flag shared by everything working on one attempt
///
/// Holds the stop code once stopped (`Some(0)` is a normal stop). Only the
/// first `stop` call takes effect, so an attempt is torn down at most once.
#[derive(Clone)]
pub struct StopSignal {
    // Own sender first, then every ancestor. Ancestor stops propagate down,
    // never up.
    chain: Vec<Arc<watch::Sender<Option<i32>>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            chain: vec![Arc::new(tx)],
        }
    }

    /// Create a signal that also reports stopped when `self` stops
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(None);
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Arc::new(tx));
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    /// Record `code` unless a stop code is already set. Returns whether it took effect.
    pub fn stop(&self, code: i32) -> bool {
        if self.chain[1..].iter().any(|tx| tx.borrow().is_some()) {
            return false;
        }
        self.chain[0].send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        })
    }

    /// Stop with a typed code
    pub fn stop_with(&self, code: StopCode) -> bool {
        self.stop(code.code())
    }

    /// The stop code, `None` while active
    pub fn code(&self) -> Option<i32> {
        self.chain.iter().find_map(|tx| *tx.borrow())
    }

    pub fn is_stopped(&self) -> bool {
        self.code().is_some()
    }

    /// Wait until the signal (or an ancestor) is stopped and return the code
    pub async fn stopped(&self) -> i32 {
        let mut receivers: Vec<_> = self.chain.iter().map(|tx| tx.subscribe()).collect();
        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                let _ = rx.wait_for(|code| code.is_some()).await;
            })
        });
        futures::future::select_all(waits).await;
        self.code().unwrap_or(StopCode::GENERAL_ERROR)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("code", &self.code())
            .finish()
    }
}
