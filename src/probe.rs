//! Single-port reachability probes.
//!
//! Two strategies share one result shape. The blocking strategy runs a
//! `connect` on the blocking thread pool with whatever is left of its
//! timeout once a pool thread picks it up; the
//! nonblocking strategy issues the connect on a nonblocking socket and
//! waits for writability on the runtime's reactor. Both walk the same
//! [`ConnectState`] machine and never return an error to the caller.
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use socket2::Socket;
use tokio::net::TcpStream;
use tokio::task;
use tokio::time;
use tracing::{debug, warn};

use crate::sockopt::{build_stream_socket, SocketOptions};
use crate::types::PortProbeResult;

/// How a probe establishes its connection.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// Blocking connect with an absolute timeout, one pool thread per probe.
    #[default]
    Blocking,
    /// Nonblocking connect plus a readiness wait on the reactor.
    Nonblocking,
}

impl fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStrategy::Blocking => f.write_str("blocking connect"),
            ProbeStrategy::Nonblocking => f.write_str("nonblocking connect"),
        }
    }
}

impl FromStr for ProbeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" | "basic" => Ok(ProbeStrategy::Blocking),
            "nonblocking" | "non-blocking" | "advanced" => Ok(ProbeStrategy::Nonblocking),
            other => Err(format!("unknown probe strategy: {other}")),
        }
    }
}

/// Lifecycle of one connection attempt.
///
/// `Created -> Connecting -> {Connected, Failed, TimedOut}`. A connect
/// that completes or fails synchronously skips `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Created,
    Connecting,
    Connected,
    Failed(io::ErrorKind),
    TimedOut,
}

impl ConnectState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectState::Connected | ConnectState::Failed(_) | ConnectState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: ConnectState) -> bool {
        use ConnectState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Created, Connected)
                | (Created, Failed(_))
                | (Connecting, Connected)
                | (Connecting, Failed(_))
                | (Connecting, TimedOut)
        )
    }
}

/// State and timing of one connection attempt. The probe's socket is a
/// local of the connect function and is closed on every return path.
struct Attempt {
    addr: SocketAddr,
    state: ConnectState,
    started: Instant,
}

impl Attempt {
    fn new(addr: SocketAddr) -> Self {
        Self::starting_at(addr, Instant::now())
    }

    fn starting_at(addr: SocketAddr, started: Instant) -> Self {
        Self {
            addr,
            state: ConnectState::Created,
            started,
        }
    }

    fn advance(&mut self, next: ConnectState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal connect transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn finish(mut self, terminal: ConnectState) -> (ConnectState, Duration) {
        self.advance(terminal);
        let elapsed = self.started.elapsed();
        debug!(addr = %self.addr, state = ?self.state, ?elapsed, "probe finished");
        (self.state, elapsed)
    }
}

/// Something that can check one `(host, port)` pair.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        strategy: ProbeStrategy,
        opts: Option<&SocketOptions>,
    ) -> PortProbeResult;
}

/// The real TCP connect prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectProbe;

#[async_trait]
impl Prober for ConnectProbe {
    async fn probe(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        strategy: ProbeStrategy,
        opts: Option<&SocketOptions>,
    ) -> PortProbeResult {
        probe(addr, timeout, strategy, opts).await
    }
}

/// Probe `addr` once. Every failure is folded into a closed result.
pub async fn probe(
    addr: SocketAddr,
    timeout: Duration,
    strategy: ProbeStrategy,
    opts: Option<&SocketOptions>,
) -> PortProbeResult {
    let (state, elapsed) = match strategy {
        ProbeStrategy::Blocking => connect_blocking(addr, timeout, opts.cloned()).await,
        ProbeStrategy::Nonblocking => connect_nonblocking(addr, timeout, opts).await,
    };
    classify(addr.port(), state, elapsed)
}

/// Map a terminal state to a result. Only `Connected` is open.
pub fn classify(port: u16, state: ConnectState, elapsed: Duration) -> PortProbeResult {
    match state {
        ConnectState::Connected => PortProbeResult::open(port, elapsed),
        _ => PortProbeResult::closed(port),
    }
}

async fn connect_blocking(
    addr: SocketAddr,
    timeout: Duration,
    opts: Option<SocketOptions>,
) -> (ConnectState, Duration) {
    // The clock starts before the pool queue so a queued attempt still
    // ends by `started + timeout`.
    let started = Instant::now();
    let run = move || blocking_connect(addr, started, timeout, opts.as_ref());
    match task::spawn_blocking(run).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(%addr, error = %e, "blocking probe task failed");
            (ConnectState::Failed(io::ErrorKind::Other), started.elapsed())
        }
    }
}

fn blocking_connect(
    addr: SocketAddr,
    started: Instant,
    timeout: Duration,
    opts: Option<&SocketOptions>,
) -> (ConnectState, Duration) {
    let mut attempt = Attempt::starting_at(addr, started);
    let socket = match build_stream_socket(&addr, opts, false) {
        Ok(s) => s,
        Err(e) => return attempt.finish(unexpected(addr, e)),
    };

    attempt.advance(ConnectState::Connecting);
    let remaining = timeout.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        debug!(%addr, "timeout spent waiting for a pool thread");
        return attempt.finish(ConnectState::TimedOut);
    }
    let terminal = match socket.connect_timeout(&addr.into(), remaining) {
        Ok(()) => ConnectState::Connected,
        Err(e) if is_timeout(&e) => ConnectState::TimedOut,
        Err(e) => ConnectState::Failed(e.kind()),
    };
    attempt.finish(terminal)
}

async fn connect_nonblocking(
    addr: SocketAddr,
    timeout: Duration,
    opts: Option<&SocketOptions>,
) -> (ConnectState, Duration) {
    let mut attempt = Attempt::new(addr);
    let socket = match build_stream_socket(&addr, opts, true) {
        Ok(s) => s,
        Err(e) => return attempt.finish(unexpected(addr, e)),
    };

    match socket.connect(&addr.into()) {
        // Loopback can complete synchronously.
        Ok(()) => return attempt.finish(ConnectState::Connected),
        Err(e) if in_progress(&e) => attempt.advance(ConnectState::Connecting),
        Err(e) => return attempt.finish(ConnectState::Failed(e.kind())),
    }

    let stream = match register(socket) {
        Ok(s) => s,
        Err(e) => return attempt.finish(unexpected(addr, e)),
    };

    let terminal = match time::timeout(timeout, stream.writable()).await {
        Err(_) => ConnectState::TimedOut,
        Ok(Err(e)) => ConnectState::Failed(e.kind()),
        Ok(Ok(())) => match stream.take_error() {
            Ok(None) => ConnectState::Connected,
            Ok(Some(e)) | Err(e) => ConnectState::Failed(e.kind()),
        },
    };
    attempt.finish(terminal)
}

/// Hand a connecting socket to the reactor so readiness can be awaited.
fn register(socket: Socket) -> io::Result<TcpStream> {
    TcpStream::from_std(std::net::TcpStream::from(socket))
}

fn unexpected(addr: SocketAddr, e: io::Error) -> ConnectState {
    debug!(%addr, error = %e, "probe socket setup failed");
    ConnectState::Failed(e.kind())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    /// Listener with a full accept queue: further SYNs are dropped, so
    /// connects to it can only time out. Fillers keep the queue full.
    fn silent_listener() -> (Socket, Vec<std::net::TcpStream>, SocketAddr) {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&bind.into()).unwrap();
        socket.listen(0).unwrap();
        let addr = socket.local_addr().unwrap().as_socket().unwrap();
        let mut fillers = Vec::new();
        for _ in 0..8 {
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(s) => fillers.push(s),
                Err(_) => break,
            }
        }
        (socket, fillers, addr)
    }

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("blocking".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::Blocking);
        assert_eq!("Non-Blocking".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::Nonblocking);
        assert_eq!("advanced".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::Nonblocking);
        assert!("syn".parse::<ProbeStrategy>().is_err());
    }

    #[test]
    fn state_machine_edges() {
        use ConnectState::*;
        assert!(Created.can_transition_to(Connecting));
        assert!(Created.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(TimedOut));
        assert!(!Created.can_transition_to(TimedOut));
        assert!(!Connected.can_transition_to(Failed(io::ErrorKind::Other)));
        assert!(!TimedOut.can_transition_to(Connecting));
        assert!(TimedOut.is_terminal() && Connected.is_terminal());
        assert!(!Connecting.is_terminal());
    }

    #[test]
    fn only_connected_is_open() {
        let ms = Duration::from_millis(4);
        assert!(classify(80, ConnectState::Connected, ms).open);
        let timed_out = classify(80, ConnectState::TimedOut, ms);
        assert!(!timed_out.open && timed_out.response_time.is_none());
        let refused = classify(80, ConnectState::Failed(io::ErrorKind::ConnectionRefused), ms);
        assert!(!refused.open && refused.response_time.is_none());
    }

    #[tokio::test]
    async fn both_strategies_see_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        for strategy in [ProbeStrategy::Blocking, ProbeStrategy::Nonblocking] {
            let res = probe(addr, Duration::from_secs(2), strategy, None).await;
            assert!(res.open, "{strategy} missed an open port");
            assert!(res.response_time.unwrap() > Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn both_strategies_agree_on_closed_port() {
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let opts = SocketOptions::tuned();
        for strategy in [ProbeStrategy::Blocking, ProbeStrategy::Nonblocking] {
            let res = probe(addr, Duration::from_secs(1), strategy, Some(&opts)).await;
            assert!(!res.open, "{strategy} reported a closed port open");
            assert!(res.response_time.is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_listener_times_out_under_both_strategies() {
        let (_listener, _fillers, addr) = silent_listener();
        let timeout = Duration::from_millis(300);

        for strategy in [ProbeStrategy::Blocking, ProbeStrategy::Nonblocking] {
            let begun = Instant::now();
            let (state, took) = match strategy {
                ProbeStrategy::Blocking => connect_blocking(addr, timeout, None).await,
                ProbeStrategy::Nonblocking => connect_nonblocking(addr, timeout, None).await,
            };
            let elapsed = begun.elapsed();
            assert_eq!(state, ConnectState::TimedOut, "{strategy}");
            assert!(took >= timeout);
            assert!(elapsed >= timeout, "{strategy} gave up after {elapsed:?}");
            assert!(elapsed < timeout + Duration::from_secs(1), "{strategy} took {elapsed:?}");

            let res = classify(addr.port(), state, took);
            assert!(!res.open, "{strategy} reported a silent port open");
            assert!(res.response_time.is_none());
        }
    }

    #[test]
    fn blocking_connect_counts_time_spent_queued() {
        let (_listener, _fillers, addr) = silent_listener();
        let timeout = Duration::from_millis(300);
        let started = Instant::now().checked_sub(timeout * 2).unwrap();

        let begun = Instant::now();
        let (state, elapsed) = blocking_connect(addr, started, timeout, None);
        assert_eq!(state, ConnectState::TimedOut);
        assert!(elapsed >= timeout * 2);
        assert!(begun.elapsed() < timeout, "connect ran after its budget was spent");
    }

    #[test]
    fn blocking_connect_uses_only_the_remaining_budget() {
        let (_listener, _fillers, addr) = silent_listener();
        let timeout = Duration::from_millis(400);
        let started = Instant::now().checked_sub(Duration::from_millis(250)).unwrap();

        let begun = Instant::now();
        let (state, elapsed) = blocking_connect(addr, started, timeout, None);
        assert_eq!(state, ConnectState::TimedOut);
        assert!(elapsed >= timeout);
        assert!(begun.elapsed() < Duration::from_millis(350), "took {:?}", begun.elapsed());
    }
}
