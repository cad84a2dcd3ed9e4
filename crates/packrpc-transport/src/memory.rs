//! In-process duplex byte pipe.
//!
//! Each direction is an unbounded byte queue guarded by a mutex and condvar.
//! Dropping the last handle of an end closes both directions, so the peer
//! reads EOF and its writes fail with `BrokenPipe`.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::traits::RpcStream;

/// Create a connected pair of in-memory streams.
pub fn pipe() -> (RpcStream, RpcStream) {
    let (left, right) = PipeEnd::pair();
    (RpcStream::from(left), RpcStream::from(right))
}

#[derive(Debug, Default)]
struct Queue {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Channel {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

#[derive(Debug)]
struct EndShared {
    incoming: Arc<Channel>,
    outgoing: Arc<Channel>,
    read_timeout: Mutex<Option<Duration>>,
}

impl Drop for EndShared {
    fn drop(&mut self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

/// One end of an in-memory pipe. Clones share the same end.
#[derive(Debug, Clone)]
pub struct PipeEnd {
    shared: Arc<EndShared>,
}

impl PipeEnd {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());
        let left = Self::new(Arc::clone(&b_to_a), Arc::clone(&a_to_b));
        let right = Self::new(a_to_b, b_to_a);
        (left, right)
    }

    fn new(incoming: Arc<Channel>, outgoing: Arc<Channel>) -> Self {
        Self {
            shared: Arc::new(EndShared {
                incoming,
                outgoing,
                read_timeout: Mutex::new(None),
            }),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        if timeout == Some(Duration::ZERO) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "cannot set a 0 duration timeout",
            ));
        }
        *self
            .shared
            .read_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = timeout;
        Ok(())
    }

    /// Close both directions. Pending and future reads on either end see EOF
    /// once buffered bytes are drained.
    pub fn shutdown(&self) {
        self.shared.incoming.close();
        self.shared.outgoing.close();
    }

    fn read_timeout(&self) -> Option<Duration> {
        *self
            .shared
            .read_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = self.read_timeout().map(|t| Instant::now() + t);
        let channel = &self.shared.incoming;
        let mut queue = channel.lock();
        loop {
            if !queue.data.is_empty() {
                let n = buf.len().min(queue.data.len());
                for (slot, byte) in buf.iter_mut().zip(queue.data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if queue.closed {
                return Ok(0);
            }

            queue = match deadline {
                None => channel.ready.wait(queue).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::from(ErrorKind::WouldBlock));
                    }
                    channel
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let channel = &self.shared.outgoing;
        let mut queue = channel.lock();
        if queue.closed {
            return Err(io::Error::from(ErrorKind::BrokenPipe));
        }
        queue.data.extend(buf);
        drop(queue);
        channel.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn bytes_flow_both_ways() {
        let (mut left, mut right) = PipeEnd::pair();
        left.write_all(b"ping").unwrap();
        right.write_all(b"pong").unwrap();

        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        left.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn read_blocks_until_data_arrives() {
        let (mut left, mut right) = PipeEnd::pair();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 3];
            right.read_exact(&mut buf).unwrap();
            buf
        });

        thread::sleep(Duration::from_millis(20));
        left.write_all(b"abc").unwrap();
        assert_eq!(&reader.join().unwrap(), b"abc");
    }

    #[test]
    fn dropping_an_end_gives_peer_eof_after_drain() {
        let (mut left, mut right) = PipeEnd::pair();
        left.write_all(b"last").unwrap();
        drop(left);

        let mut rest = Vec::new();
        right.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"last");

        let err = right.write(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn clones_keep_the_end_open() {
        let (left, mut right) = PipeEnd::pair();
        let mut clone = left.clone();
        drop(left);

        clone.write_all(b"still").unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still");
    }

    #[test]
    fn shutdown_wakes_blocked_reader() {
        let (left, right) = PipeEnd::pair();
        let mut reader_end = right.clone();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader_end.read(&mut buf).unwrap()
        });

        thread::sleep(Duration::from_millis(20));
        right.shutdown();
        assert_eq!(reader.join().unwrap(), 0);
        drop(left);
    }

    #[test]
    fn read_timeout_reports_would_block() {
        let (_left, mut right) = PipeEnd::pair();
        right
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        let mut buf = [0u8; 1];
        let err = right.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let (left, _right) = PipeEnd::pair();
        let err = left.set_read_timeout(Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
