//! Readiness multiplexer.
//!
//! Wraps `mio::Poll` (epoll on Linux, kqueue on macOS) behind the only
//! question the scheduler ever asks: "block until any of these fds is
//! ready, then tell me which ones, and in which direction".
//!
//! Registrations are keyed by raw fd via `SourceFd`, so the poller never
//! needs to borrow the socket itself — tasks keep exclusive ownership of
//! their streams and hand out fds only. Every suspension re-registers or
//! re-arms its fd, so edge-triggered delivery cannot strand a handle that
//! is still ready.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// Default event batch capacity per poll call.
const EVENT_CAPACITY: usize = 256;

/// Readiness poller with per-fd interest bookkeeping.
///
/// A single fd may be registered for read interest, write interest, or
/// both; `add`/`remove` keep the kernel-side registration in sync with
/// the union of directions currently waited on.
pub struct Poller {
    poll: Poll,
    events: Events,
    interests: HashMap<RawFd, Interest>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            interests: HashMap::new(),
        })
    }

    /// Register interest in `fd` for one direction, merging with any
    /// interest already registered for the other direction.
    pub fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.interests.entry(fd) {
            Entry::Occupied(mut entry) => {
                let combined = entry.get().add(interest);
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), combined)?;
                entry.insert(combined);
            }
            Entry::Vacant(entry) => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                entry.insert(interest);
            }
        }
        Ok(())
    }

    /// Drop interest in `fd` for one direction, deregistering the fd
    /// entirely once no direction remains. Unknown fds are ignored.
    pub fn remove(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(current) = self.interests.get(&fd).copied() else {
            return Ok(());
        };
        match current.remove(interest) {
            Some(remaining) => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), remaining)?;
                self.interests.insert(fd, remaining);
            }
            None => {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                self.interests.remove(&fd);
            }
        }
        Ok(())
    }

    /// Block until at least one registered fd is ready, then append the
    /// ready fds to `readable` and `writable`.
    ///
    /// Must only be called with at least one fd registered; with none,
    /// this would block forever. The scheduler's loop guard upholds that.
    pub fn wait(&mut self, readable: &mut Vec<RawFd>, writable: &mut Vec<RawFd>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            if event.is_readable() {
                readable.push(fd);
            }
            if event.is_writable() {
                writable.push(fd);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_reports_readable_fd() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let fd = rx.as_raw_fd();

        let mut poller = Poller::new().unwrap();
        poller.add(fd, Interest::READABLE).unwrap();

        tx.write_all(b"x").unwrap();

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        poller.wait(&mut readable, &mut writable).unwrap();

        assert!(readable.contains(&fd));
        assert!(writable.is_empty());
    }

    #[test]
    fn test_remove_downgrades_then_deregisters() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let fd = tx.as_raw_fd();

        let mut poller = Poller::new().unwrap();
        poller.add(fd, Interest::READABLE).unwrap();
        poller.add(fd, Interest::WRITABLE).unwrap();

        poller.remove(fd, Interest::READABLE).unwrap();
        assert_eq!(poller.interests.get(&fd), Some(&Interest::WRITABLE));

        poller.remove(fd, Interest::WRITABLE).unwrap();
        assert!(!poller.interests.contains_key(&fd));

        // Removing an unknown fd is a no-op.
        poller.remove(fd, Interest::READABLE).unwrap();
    }

    #[test]
    fn test_writable_socket_reported_immediately() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let fd = tx.as_raw_fd();

        let mut poller = Poller::new().unwrap();
        poller.add(fd, Interest::WRITABLE).unwrap();

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        poller.wait(&mut readable, &mut writable).unwrap();

        assert!(writable.contains(&fd));
    }
}
