//! TCP server built on the cooperative runtime.
//!
//! Two task kinds: the accept task suspends on listener readability and
//! spawns one handler per accepted connection; each handler drives the
//! numeric line protocol over its own socket. Each task exclusively owns
//! its socket, so wait-set entries never collide across connections.

use crate::protocol::{self, Transform};
use crate::runtime::{Context, Step, Task, Wakeup};
use mio::net::{TcpListener, TcpStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info, trace};

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// A bound, not-yet-running server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    transform: Transform,
    read_chunk: usize,
}

impl Server {
    /// Resolve `addr`, bind a non-blocking listener with SO_REUSEADDR,
    /// and start listening.
    pub fn bind(addr: &str, transform: Transform, read_chunk: usize) -> io::Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        })?;

        let listener = create_listener(addr)?;
        let listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            transform,
            read_chunk,
        })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Convert into the accept-loop task, ready to be spawned.
    pub fn into_task(self) -> AcceptTask {
        AcceptTask {
            listener: self.listener,
            transform: self.transform,
            read_chunk: self.read_chunk,
            armed: false,
        }
    }
}

/// Accept-loop task: waits for listener readability, accepts one
/// connection, spawns a handler for it, and re-suspends. Never
/// terminates on its own.
pub struct AcceptTask {
    listener: TcpListener,
    transform: Transform,
    read_chunk: usize,
    armed: bool,
}

impl Task for AcceptTask {
    fn step(&mut self, ctx: &mut Context) -> io::Result<Step> {
        if !self.armed {
            self.armed = true;
            return Ok(Step::Wait(Wakeup::readable(self.listener.as_raw_fd())));
        }

        match self.listener.accept() {
            Ok((stream, peer)) => {
                info!(peer = %peer, "connection accepted");
                ctx.spawn(Handler::new(stream, self.transform, self.read_chunk));
            }
            // Readiness was stale; just wait again.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        Ok(Step::Wait(Wakeup::readable(self.listener.as_raw_fd())))
    }
}

/// Per-connection protocol state machine.
///
/// Each variant names the readiness the task was last suspended for:
/// `Recv` steps run after the socket turned readable, `Send` steps after
/// it turned writable. `Start` exists only to issue the first suspension.
enum HandlerState {
    Start,
    Recv,
    Send { reply: Vec<u8> },
}

pub struct Handler {
    stream: TcpStream,
    transform: Transform,
    read_chunk: usize,
    state: HandlerState,
}

impl Handler {
    fn new(stream: TcpStream, transform: Transform, read_chunk: usize) -> Self {
        Self {
            stream,
            transform,
            read_chunk,
            state: HandlerState::Start,
        }
    }
}

impl Task for Handler {
    fn step(&mut self, _ctx: &mut Context) -> io::Result<Step> {
        let fd = self.stream.as_raw_fd();

        match std::mem::replace(&mut self.state, HandlerState::Recv) {
            HandlerState::Start => Ok(Step::Wait(Wakeup::readable(fd))),

            HandlerState::Recv => {
                let mut buf = vec![0u8; self.read_chunk];
                let n = match self.stream.read(&mut buf) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Step::Wait(Wakeup::readable(fd)));
                    }
                    Err(e) => return Err(e),
                };

                let request = &buf[..n];
                if protocol::is_blank(request) {
                    // Blank request or peer EOF: close and complete.
                    let _ = self.stream.shutdown(Shutdown::Both);
                    debug!(fd, "connection closed");
                    return Ok(Step::Done);
                }

                let reply = protocol::respond(request, self.transform)?;
                trace!(fd, bytes = n, "request parsed");
                self.state = HandlerState::Send { reply };
                Ok(Step::Wait(Wakeup::writable(fd)))
            }

            HandlerState::Send { reply } => {
                let n = match self.stream.write(&reply) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state = HandlerState::Send { reply };
                        return Ok(Step::Wait(Wakeup::writable(fd)));
                    }
                    Err(e) => return Err(e),
                };
                if n < reply.len() {
                    // Replies are a few bytes; a short write is not retried.
                    debug!(fd, written = n, total = reply.len(), "short write");
                }
                Ok(Step::Wait(Wakeup::readable(fd)))
            }
        }
    }
}

/// Create a TCP listener the way the original server does: SO_REUSEADDR,
/// non-blocking, bound and listening.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::add42;
    use crate::runtime::Scheduler;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Bind on an ephemeral port and run the scheduler on its own thread.
    /// The returned channel yields the scheduler's exit result, which the
    /// accept loop only produces on a fatal error.
    fn start_server() -> (SocketAddr, mpsc::Receiver<io::Result<()>>) {
        let server = Server::bind("127.0.0.1:0", add42, 100).unwrap();
        let addr = server.local_addr();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let run = move || -> io::Result<()> {
                let mut sched = Scheduler::new()?;
                sched.spawn(server.into_task());
                sched.run()
            };
            let _ = tx.send(run());
        });
        (addr, rx)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn request(stream: &mut TcpStream, line: &str) -> String {
        stream.write_all(line.as_bytes()).unwrap();
        let mut buf = [0u8; 100];
        let n = stream.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_round_trip() {
        let (addr, _rx) = start_server();
        let mut client = connect(addr);
        assert_eq!(request(&mut client, "5\n"), "47\n");
        assert_eq!(request(&mut client, "100\n"), "142\n");
    }

    #[test]
    fn test_blank_request_closes_connection() {
        let (addr, _rx) = start_server();
        let mut client = connect(addr);
        client.write_all(b"   \n").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_client_eof_closes_connection() {
        let (addr, _rx) = start_server();
        let mut client = connect(addr);
        client.shutdown(Shutdown::Write).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_clients_no_cross_talk() {
        let (addr, _rx) = start_server();
        let mut a = connect(addr);
        let mut b = connect(addr);
        assert_eq!(request(&mut a, "1\n"), "43\n");
        assert_eq!(request(&mut b, "2\n"), "44\n");
        assert_eq!(request(&mut b, "10\n"), "52\n");
        assert_eq!(request(&mut a, "20\n"), "62\n");
    }

    #[test]
    fn test_malformed_input_is_fatal_to_the_loop() {
        let (addr, rx) = start_server();
        let mut client = connect(addr);
        client.write_all(b"abc\n").unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
