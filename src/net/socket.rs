//! Non-blocking outbound connects.

use std::io::ErrorKind;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Begin a non-blocking connect. Immediate refusals are reported as errors;
/// anything else completes or fails on later [`poll_connect`] calls.
pub fn start_connect(dest: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(dest), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(dest)) {
        Ok(()) => Ok(socket),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::NetworkUnreachable
                    | ErrorKind::HostUnreachable
                    | ErrorKind::AddrNotAvailable
                    | ErrorKind::PermissionDenied
            ) =>
        {
            Err(e)
        }
        Err(_) => Ok(socket),
    }
}

/// True once a connect started by [`start_connect`] has completed; the
/// socket's pending error if it failed.
pub fn poll_connect(socket: &Socket) -> std::io::Result<bool> {
    if let Some(e) = socket.take_error()? {
        return Err(e);
    }
    Ok(socket.peer_addr().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_connect_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = start_connect(listener.local_addr().unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !poll_connect(&socket).unwrap() {
            assert!(Instant::now() < deadline, "connect did not complete");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_refused_connect_fails() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let dest = SocketAddr::from(([127, 0, 0, 1], port));
        let failed = match start_connect(dest) {
            Err(e) => e.kind() == ErrorKind::ConnectionRefused,
            Ok(socket) => {
                let deadline = Instant::now() + Duration::from_secs(5);
                loop {
                    match poll_connect(&socket) {
                        Err(e) => break e.kind() == ErrorKind::ConnectionRefused,
                        Ok(true) => break false,
                        Ok(false) if Instant::now() > deadline => break false,
                        Ok(false) => thread::sleep(Duration::from_millis(10)),
                    }
                }
            }
        };
        assert!(failed);
    }
}
