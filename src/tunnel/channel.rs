//! Channel capabilities
//!
//! Both ends of a tunnel expose the same two capability sets:
//! [`ByteStreamChannel`] for moving bytes and [`ConfigurableTransport`] for
//! runtime tuning. [`ChannelIo`] adapts any byte stream channel to
//! `std::io::Read` and `std::io::Write`.

use super::{Completion, Result, TunnelConfig, TunnelId};
use bytes::{Buf, Bytes};
use std::io;
use std::num::NonZeroUsize;
use std::time::Duration;

/// An ordered, full-duplex byte stream
pub trait ByteStreamChannel {
    /// Identifier of the tunnel carrying this stream, once known
    fn tunnel_id(&self) -> Option<TunnelId>;

    /// Queue `data` for delivery to the peer
    ///
    /// The completion settles once the bytes have been written to the
    /// peer's HTTP exchange, or fails if the channel closes first.
    fn write(&self, data: Bytes) -> Completion;

    /// Wait up to `timeout` for inbound bytes
    ///
    /// `Ok(None)` means end of stream. `Error::Timeout` means nothing arrived.
    fn read_timeout(&self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Close the stream; calling this more than once has no further effect
    fn close(&self) -> Completion;

    fn is_open(&self) -> bool;
}

/// A transport whose tuning can be inspected and adjusted while in use
pub trait ConfigurableTransport {
    fn config(&self) -> &TunnelConfig;

    /// Current outbound fragment size
    fn split_threshold(&self) -> NonZeroUsize;

    /// Change the outbound fragment size for subsequent writes
    fn set_split_threshold(&self, threshold: NonZeroUsize);
}

/// `std::io` adapter over a [`ByteStreamChannel`]
///
/// Writes block until the channel reports the bytes as delivered to the
/// transport; reads block up to `read_timeout` per call.
pub struct ChannelIo<C> {
    channel: C,
    read_timeout: Duration,
    leftover: Bytes,
}

impl<C: ByteStreamChannel> ChannelIo<C> {
    pub fn new(channel: C, read_timeout: Duration) -> Self {
        ChannelIo {
            channel,
            read_timeout,
            leftover: Bytes::new(),
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

fn to_io_error(err: super::Error) -> io::Error {
    let kind = match err {
        super::Error::Timeout => io::ErrorKind::TimedOut,
        super::Error::ChannelClosed | super::Error::NotConnected => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl<C: ByteStreamChannel> io::Read for ChannelIo<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.leftover.is_empty() {
            match self.channel.read_timeout(self.read_timeout) {
                Ok(Some(bytes)) => self.leftover = bytes,
                Ok(None) => return Ok(0),
                Err(err) => return Err(to_io_error(err)),
            }
        }

        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }
}

impl<C: ByteStreamChannel> io::Write for ChannelIo<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.channel
            .write(Bytes::copy_from_slice(buf))
            .wait()
            .map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// In-memory loopback channel
    #[derive(Default)]
    struct Loopback {
        queue: Mutex<VecDeque<Bytes>>,
        closed: Mutex<bool>,
    }

    impl ByteStreamChannel for Loopback {
        fn tunnel_id(&self) -> Option<TunnelId> {
            None
        }

        fn write(&self, data: Bytes) -> Completion {
            self.queue.lock().push_back(data);
            Completion::succeeded()
        }

        fn read_timeout(&self, _timeout: Duration) -> Result<Option<Bytes>> {
            match self.queue.lock().pop_front() {
                Some(bytes) => Ok(Some(bytes)),
                None if *self.closed.lock() => Ok(None),
                None => Err(super::super::Error::Timeout),
            }
        }

        fn close(&self) -> Completion {
            *self.closed.lock() = true;
            Completion::succeeded()
        }

        fn is_open(&self) -> bool {
            !*self.closed.lock()
        }
    }

    #[test]
    fn test_read_splits_chunks_across_calls() {
        let mut io = ChannelIo::new(Loopback::default(), Duration::from_millis(10));
        io.write_all(b"hello world").unwrap();

        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let mut rest = [0u8; 6];
        io.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b" world");
    }

    #[test]
    fn test_read_end_of_stream_and_timeout() {
        let mut io = ChannelIo::new(Loopback::default(), Duration::from_millis(10));

        let mut buf = [0u8; 4];
        let err = io.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        io.get_ref().close();
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }
}
