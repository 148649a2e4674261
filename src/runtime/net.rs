//! Nonblocking TCP plumbing over the reactor: DNS on the blocking pool,
//! in-flight connects awaited on writability, and readiness-driven
//! read/write helpers shared by the HTTP and MySQL clients.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use mio::net::TcpStream;

use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::runtime::Handle;

/// Resolve then connect, trying each address in order.
pub(crate) async fn connect(
    handle: &Handle,
    host: &str,
    port: u16,
    nodelay: bool,
) -> Result<TcpStream> {
    let addrs = resolve(handle, host.to_string(), port).await?;
    let mut last = None;
    for addr in addrs {
        match connect_addr(handle, addr).await {
            Ok(stream) => {
                if nodelay {
                    stream.set_nodelay(true)?;
                }
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::BadConfig(format!("no addresses resolved for {}", host))))
}

/// DNS resolution runs on the blocking pool; literal IPs skip it.
async fn resolve(handle: &Handle, host: String, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let (promise, settler) = handle.promise::<Vec<SocketAddr>>();
    handle.unblock(
        move || -> Result<Vec<SocketAddr>> {
            (host.as_str(), port)
                .to_socket_addrs()
                .map(Iterator::collect)
                .map_err(Error::from)
        },
        move |result| settler.settle(result),
    );
    promise.await
}

/// Start a nonblocking connect and wait for the socket to become writable;
/// the deferred error is read back with `take_error`.
async fn connect_addr(handle: &Handle, addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    handle.writable(stream.as_raw_fd()).await?;
    if let Some(err) = stream.take_error()? {
        return Err(err.into());
    }
    match stream.peer_addr() {
        Ok(_) => Ok(stream),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Err(Error::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("connect to {} failed", addr),
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Read once into `buf`, suspending on WouldBlock. `Ok(0)` is EOF.
pub(crate) async fn read_some(
    handle: &Handle,
    stream: &TcpStream,
    buf: &mut [u8],
) -> Result<usize> {
    loop {
        let mut r: &TcpStream = stream;
        match r.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                handle.readable(stream.as_raw_fd()).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Fill `buf` completely; EOF mid-read is a transport error.
pub(crate) async fn read_exact(
    handle: &Handle,
    stream: &TcpStream,
    buf: &mut [u8],
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_some(handle, stream, &mut buf[filled..]).await? {
            0 => {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
            n => filled += n,
        }
    }
    Ok(())
}

/// Write all of `data`, suspending on WouldBlock.
pub(crate) async fn write_all(handle: &Handle, stream: &TcpStream, data: &[u8]) -> Result<()> {
    let mut remaining = data;
    while !remaining.is_empty() {
        let mut w: &TcpStream = stream;
        match w.write(remaining) {
            Ok(0) => {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                )));
            }
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                handle.writable(stream.as_raw_fd()).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Race a future against a signal promise. When the signal settles first
/// the future loses: a fulfilled signal yields `error`, a rejected signal
/// yields its own reason. The losing future is dropped, which unwinds any
/// readiness registrations it made.
pub(crate) struct RaceAgainst<F> {
    pub(crate) signal: Promise<()>,
    pub(crate) error: Error,
    pub(crate) fut: F,
}

impl<T, F> Future for RaceAgainst<F>
where
    T: 'static,
    F: Future<Output = Result<T>>,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: no field is moved out of the pinned struct below.
        let this = unsafe { self.get_unchecked_mut() };
        // SAFETY: `fut` is structurally pinned; it is never relocated once
        // polled and RaceAgainst has no Drop of its own.
        let fut = unsafe { Pin::new_unchecked(&mut this.fut) };
        if let Poll::Ready(out) = fut.poll(cx) {
            return Poll::Ready(out);
        }
        match Pin::new(&mut this.signal).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Err(this.error.clone())),
            Poll::Ready(Err(reason)) => Poll::Ready(Err(reason)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Cancels the deadline on drop, so neither completion nor mid-flight
/// cancellation leaves an orphan timer keeping the loop alive.
struct SleepGuard {
    sleep: crate::promise::CancellablePromise<()>,
}

impl Drop for SleepGuard {
    fn drop(&mut self) {
        self.sleep.cancel();
    }
}

/// Bound a future by a wall-clock limit; the timer is torn down as soon as
/// the future wins (or the whole race is dropped).
pub(crate) async fn timed<T, F>(handle: &Handle, limit: Option<Duration>, fut: F) -> Result<T>
where
    T: 'static,
    F: Future<Output = Result<T>>,
{
    let Some(limit) = limit else {
        return fut.await;
    };
    let guard = SleepGuard {
        sleep: handle.delay(limit),
    };
    RaceAgainst {
        signal: guard.sleep.promise(),
        error: Error::Timeout,
        fut,
    }
    .await
}
