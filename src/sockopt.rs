//! Stream socket construction with optional tuning.
//!
//! Every option except blocking mode is applied best-effort: a platform
//! that rejects a setting still yields a usable socket.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::debug;

/// TCP keepalive parameters (idle time, probe interval, probe count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveParams {
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u32,
}

impl Default for KeepaliveParams {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            probes: 9,
        }
    }
}

/// Options applied to a probe socket before it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub reuse_addr: bool,
    pub nodelay: bool,
    pub keepalive: Option<KeepaliveParams>,
    pub linger: Option<Duration>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

impl SocketOptions {
    /// Client-side preset: address reuse, no Nagle, short keepalive.
    pub fn tuned() -> Self {
        Self {
            reuse_addr: true,
            nodelay: true,
            keepalive: Some(KeepaliveParams {
                idle: Duration::from_secs(600),
                interval: Duration::from_secs(60),
                probes: 3,
            }),
            linger: None,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    pub fn with_buffers(mut self, recv: usize, send: usize) -> Self {
        self.recv_buffer_size = Some(recv);
        self.send_buffer_size = Some(send);
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }
}

/// Create a TCP stream socket for `addr`'s family with `opts` applied.
///
/// Only socket creation and the blocking-mode switch can fail; every
/// other setting is logged and skipped when the platform refuses it.
pub fn build_stream_socket(
    addr: &SocketAddr,
    opts: Option<&SocketOptions>,
    nonblocking: bool,
) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

    if let Some(opts) = opts {
        apply_options(&socket, opts);
    }

    socket.set_nonblocking(nonblocking)?;
    Ok(socket)
}

fn apply_options(socket: &Socket, opts: &SocketOptions) {
    if opts.reuse_addr {
        best_effort("SO_REUSEADDR", socket.set_reuse_address(true));
    }
    if opts.nodelay {
        best_effort("TCP_NODELAY", socket.set_nodelay(true));
    }
    if let Some(ka) = opts.keepalive {
        best_effort("SO_KEEPALIVE", socket.set_keepalive(true));
        best_effort("TCP_KEEPALIVE", socket.set_tcp_keepalive(&keepalive_for(ka)));
    }
    if let Some(linger) = opts.linger {
        best_effort("SO_LINGER", socket.set_linger(Some(linger)));
    }
    if let Some(size) = opts.recv_buffer_size {
        best_effort("SO_RCVBUF", socket.set_recv_buffer_size(size));
    }
    if let Some(size) = opts.send_buffer_size {
        best_effort("SO_SNDBUF", socket.set_send_buffer_size(size));
    }
}

fn keepalive_for(params: KeepaliveParams) -> TcpKeepalive {
    let ka = TcpKeepalive::new().with_time(params.idle);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "windows"
    ))]
    let ka = ka.with_interval(params.interval);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    ))]
    let ka = ka.with_retries(params.probes);

    ka
}

fn best_effort(option: &'static str, res: io::Result<()>) {
    if let Err(e) = res {
        debug!(option, error = %e, "socket option not applied");
    }
}
