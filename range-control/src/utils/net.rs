use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Single bounded TCP connect, used as the SSH reachability probe.
pub fn probe_tcp(ip: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addr) = format!("{ip}:{port}").parse::<SocketAddr>() else {
        return false;
    };
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}
