// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loops that move a whole transfer through a channel that may accept or
//! return less than asked for on each call.

use crate::Phase;
use crate::TransferError;
use std::io::ErrorKind;
use std::time::Instant;

pub(crate) enum Stall {
    Io(std::io::Error),
    TimedOut,
}

/// A transfer that stopped before completing.
pub(crate) struct Stalled {
    transferred: usize,
    stall: Stall,
}

impl Stalled {
    pub fn into_error(self, phase: Phase, total: usize) -> TransferError {
        let transferred = self.transferred;
        match (self.stall, phase) {
            (Stall::TimedOut, phase) => TransferError::TimedOut { phase, transferred },
            (Stall::Io(source), Phase::Send) => TransferError::Send {
                transferred,
                total,
                source,
            },
            (Stall::Io(source), Phase::Receive) => TransferError::Receive {
                transferred,
                total,
                source,
            },
        }
    }
}

/// Calls `op` with the current offset until `total` bytes have been moved.
///
/// `op` returns the number of bytes it moved starting at the offset. A call
/// that moves nothing fails the transfer with `zero`. Interrupted calls are
/// retried.
pub(crate) fn pump(
    phase: Phase,
    total: usize,
    deadline: Option<Instant>,
    zero: ErrorKind,
    mut op: impl FnMut(usize) -> std::io::Result<usize>,
) -> Result<(), Stalled> {
    let mut count = 0;
    while count < total {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Stalled {
                transferred: count,
                stall: Stall::TimedOut,
            });
        }
        match op(count) {
            Ok(0) => {
                return Err(Stalled {
                    transferred: count,
                    stall: Stall::Io(zero.into()),
                })
            }
            Ok(n) => {
                debug_assert!(n <= total - count);
                count += n;
                tracing::trace!(%phase, n, count, total, "chunk");
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(Stalled {
                    transferred: count,
                    stall: Stall::Io(err),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn accumulates_partial_calls() {
        let mut calls = Vec::new();
        pump(Phase::Send, 10, None, ErrorKind::WriteZero, |offset| {
            calls.push(offset);
            Ok((10 - offset).min(3))
        })
        .ok()
        .unwrap();
        assert_eq!(calls, [0, 3, 6, 9]);
    }

    #[test]
    fn empty_transfer_makes_no_calls() {
        pump(Phase::Receive, 0, None, ErrorKind::UnexpectedEof, |_| {
            panic!("unexpected call")
        })
        .ok()
        .unwrap();
    }

    #[test]
    fn interrupted_is_retried() {
        let mut interrupted = false;
        pump(Phase::Send, 4, None, ErrorKind::WriteZero, |_| {
            if !interrupted {
                interrupted = true;
                return Err(ErrorKind::Interrupted.into());
            }
            Ok(4)
        })
        .ok()
        .unwrap();
        assert!(interrupted);
    }

    #[test]
    fn zero_progress_fails() {
        let stalled = pump(Phase::Receive, 8, None, ErrorKind::UnexpectedEof, |offset| {
            Ok(if offset == 0 { 5 } else { 0 })
        })
        .err()
        .unwrap();
        match stalled.into_error(Phase::Receive, 8) {
            TransferError::Receive {
                transferred,
                total,
                source,
            } => {
                assert_eq!((transferred, total), (5, 8));
                assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
            }
            err => panic!("unexpected error {err}"),
        }
    }

    #[test]
    fn expired_deadline() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let stalled = pump(Phase::Send, 100, Some(deadline), ErrorKind::WriteZero, |_| {
            std::thread::sleep(Duration::from_millis(15));
            Ok(10)
        })
        .err()
        .unwrap();
        assert!(matches!(
            stalled.into_error(Phase::Send, 100),
            TransferError::TimedOut {
                phase: Phase::Send,
                transferred,
            } if transferred > 0 && transferred < 100
        ));
    }
}
