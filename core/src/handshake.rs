//! Host/core polling protocol and the serialized diagnostic channel.

use std::fmt::{self, Write};

use lockstep_common::{diag_flag_for, diag_flag_owner, DIAG_FLAG_EMPTY, DIAG_MESSAGE_SIZE};

use crate::spin::SpinLock;
use crate::sync::{AtomicU32, Backoff, Ordering};

/// Unwind payload used to stop a core after an abort.
///
/// The host's core wrapper catches it; anything else that unwinds out of a
/// core program is a real panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

/// Stops the calling core without running the panic hook.
pub(crate) fn halt() -> ! {
    std::panic::resume_unwind(Box::new(Halted))
}

/// Formats `args` into at most `DIAG_MESSAGE_SIZE - 1` bytes, cutting on a
/// character boundary.
pub fn format_bounded(args: fmt::Arguments<'_>) -> String {
    let mut out = Bounded { buf: String::new(), limit: DIAG_MESSAGE_SIZE - 1 };
    // Bounded never fails; a truncated message is still a message.
    let _ = out.write_fmt(args);
    out.buf
}

struct Bounded {
    buf: String,
    limit: usize,
}

impl Write for Bounded {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.limit - self.buf.len();
        if s.len() <= room {
            self.buf.push_str(s);
        } else {
            let mut cut = room;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&s[..cut]);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct DiagBuffer {
    len: usize,
    bytes: [u8; DIAG_MESSAGE_SIZE],
}

/// The single, system-wide diagnostic slot.
///
/// Producers serialize on `producers`, fill the buffer, publish their pid
/// in `flag` and spin until the host consumes the message and clears the
/// flag. At most one message is ever in flight.
#[derive(Debug)]
pub struct DiagnosticChannel {
    producers: SpinLock<()>,
    flag: AtomicU32,
    buffer: SpinLock<DiagBuffer>,
}

impl DiagnosticChannel {
    pub fn new() -> Self {
        Self {
            producers: SpinLock::new(()),
            flag: AtomicU32::new(DIAG_FLAG_EMPTY),
            buffer: SpinLock::new(DiagBuffer { len: 0, bytes: [0; DIAG_MESSAGE_SIZE] }),
        }
    }

    /// Blocks until the host has consumed `message`.
    pub fn post(&self, pid: usize, message: &str) {
        let _turn = self.producers.lock();
        {
            let mut buffer = self.buffer.lock();
            let mut len = message.len().min(DIAG_MESSAGE_SIZE - 1);
            while !message.is_char_boundary(len) {
                len -= 1;
            }
            buffer.bytes[..len].copy_from_slice(&message.as_bytes()[..len]);
            buffer.bytes[len] = 0;
            buffer.len = len;
        }
        self.flag.store(diag_flag_for(pid), Ordering::Release);

        // Wait for it to be printed
        let mut backoff = Backoff::new();
        while self.flag.load(Ordering::Acquire) != DIAG_FLAG_EMPTY {
            backoff.snooze();
        }
    }

    /// Host side: takes the pending message, if any, and releases its
    /// producer.
    pub fn try_take(&self) -> Option<(usize, String)> {
        let pid = diag_flag_owner(self.flag.load(Ordering::Acquire))?;
        let text = {
            let buffer = self.buffer.lock();
            String::from_utf8_lossy(&buffer.bytes[..buffer.len]).into_owned()
        };
        self.flag.store(DIAG_FLAG_EMPTY, Ordering::Release);
        Some((pid, text))
    }

    /// Producer currently waiting on the host, if any.
    pub fn pending(&self) -> Option<usize> {
        diag_flag_owner(self.flag.load(Ordering::Acquire))
    }
}

impl Default for DiagnosticChannel {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn one_message_in_flight() {
        loom::model(|| {
            let channel = Arc::new(DiagnosticChannel::new());
            let producer = {
                let channel = channel.clone();
                thread::spawn(move || channel.post(1, "hello"))
            };
            let mut taken = None;
            while taken.is_none() {
                taken = channel.try_take();
                thread::yield_now();
            }
            producer.join().unwrap();
            assert_eq!(taken, Some((1, "hello".to_string())));
        });
    }
}
