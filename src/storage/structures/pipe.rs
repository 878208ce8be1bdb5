// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-process bidirectional byte stream used to connect the sender and
//! receiver of a same-host migration.
//!
//! Each end implements `Read` + `Write`. Dropping an end closes both of its
//! directions, and cancelling the shared token fails pending and future
//! reads and writes on both ends, so an error on either side tears the
//! whole transfer down.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::storage::structures::Cancel;

/// How often a blocked reader re-checks the cancellation token.
const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct HalfState {
    buf: VecDeque<u8>,
    write_closed: bool,
    read_closed: bool,
}

#[derive(Debug, Default)]
struct Half {
    state: Mutex<HalfState>,
    cond: Condvar,
}

/// One end of an in-process pipe pair.
#[derive(Debug)]
pub struct PipeEnd {
    read: Arc<Half>,
    write: Arc<Half>,
    cancel: Cancel,
}

/// Create a connected pair of pipe ends whose lifetime is bound to the
/// given cancellation token.
pub fn pipe_pair(cancel: &Cancel) -> (PipeEnd, PipeEnd) {
    let a_to_b = Arc::new(Half::default());
    let b_to_a = Arc::new(Half::default());

    (
        PipeEnd {
            read: Arc::clone(&b_to_a),
            write: Arc::clone(&a_to_b),
            cancel: cancel.clone(),
        },
        PipeEnd {
            read: a_to_b,
            write: b_to_a,
            cancel: cancel.clone(),
        },
    )
}

fn cancelled_err() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "migration pipe cancelled")
}

impl Read for PipeEnd {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.read.state.lock().expect("pipe poisoned");
        loop {
            if self.cancel.is_cancelled() {
                return Err(cancelled_err());
            }

            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = state.buf.pop_front().expect("checked non-empty");
                }
                return Ok(n);
            }

            if state.write_closed {
                return Ok(0);
            }

            let (guard, _) = self
                .read
                .cond
                .wait_timeout(state, WAIT_SLICE)
                .expect("pipe poisoned");
            state = guard;
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_err());
        }

        let mut state = self.write.state.lock().expect("pipe poisoned");
        if state.read_closed || state.write_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "migration pipe peer closed",
            ));
        }

        state.buf.extend(data.iter().copied());
        self.write.cond.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        {
            let mut state = self.write.state.lock().expect("pipe poisoned");
            state.write_closed = true;
            self.write.cond.notify_all();
        }
        {
            let mut state = self.read.state.lock().expect("pipe poisoned");
            state.read_closed = true;
            self.read.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    /// Bytes written on one end arrive on the other; dropping the writer
    /// ends the stream.
    fn round_trip_and_eof() {
        let cancel = Cancel::new();
        let (mut a, mut b) = pipe_pair(&cancel);

        let writer = thread::spawn(move || {
            a.write_all(b"hello").unwrap();
            // a dropped here: EOF on b.
        });

        let mut buf = Vec::new();
        b.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        writer.join().unwrap();
    }

    #[test]
    /// Cancellation fails a blocked reader.
    fn cancel_unblocks_reader() {
        let cancel = Cancel::new();
        let (_a, mut b) = pipe_pair(&cancel);

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            b.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        let result = handle.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    /// Writing after the peer dropped reports a broken pipe.
    fn broken_pipe_after_peer_drop() {
        let cancel = Cancel::new();
        let (mut a, b) = pipe_pair(&cancel);
        drop(b);
        assert_eq!(
            a.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
