//! UDP batch ingestor
//!
//! N dedicated OS worker threads share one UDP port through `SO_REUSEPORT`
//! and pull datagrams with the platform batch-receive primitive. Shutdown
//! is cooperative: a relaxed atomic flag plus a one-byte self-datagram
//! wake, with a bounded receive timeout as the backstop for workers the
//! wake datagram did not reach. A worker's socket is closed only after it
//! has left the receive loop, and `stop` returns only once every worker
//! has passed the stop barrier.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::protocol::{IngestError, RespParser};
use crate::query::QueryProcessor;
use crate::signal::SignalHandler;
use crate::storage::{Connection, Session};
use crate::types::ServerSettings;

use super::{IngestionMetrics, Server};

/// Datagrams pulled per batch-receive syscall.
pub const NPACKETS: usize = 512;

/// Per-datagram receive buffer size.
pub const MTU: usize = 2048;

/// Receive timeout bounding how long a worker can miss the stop flag.
const RECV_TIMEOUT_USEC: libc::suseconds_t = 500_000;

/// Registry factory for `"UDP"` settings.
pub(super) fn build(
    con: Arc<Connection>,
    _qproc: Arc<QueryProcessor>,
    settings: &ServerSettings,
) -> Result<Arc<dyn Server>> {
    if settings.protocols.len() != 1 {
        bail!("invalid UDP server settings: expected exactly one protocol endpoint");
    }
    Ok(Arc::new(UdpServer::new(
        con,
        settings.protocols[0].addr,
        settings.pool_size(),
    )))
}

pub struct UdpServer {
    inner: Arc<Inner>,
}

struct Inner {
    con: Arc<Connection>,
    nworkers: usize,
    /// Endpoint after binding; resolves port 0 to the real port
    addr: Mutex<SocketAddr>,
    /// Socket bound by `start`, handed to the first worker that asks
    primary_socket: Mutex<Option<UdpSocket>>,
    start_barrier: Barrier,
    stop_barrier: Barrier,
    stop: AtomicBool,
    stopped: AtomicBool,
    setup_error: Mutex<Option<String>>,
    metrics: IngestionMetrics,
}

impl UdpServer {
    pub fn new(con: Arc<Connection>, addr: SocketAddr, nworkers: usize) -> Self {
        let nworkers = nworkers.max(1);
        Self {
            inner: Arc::new(Inner {
                con,
                nworkers,
                addr: Mutex::new(addr),
                primary_socket: Mutex::new(None),
                start_barrier: Barrier::new(nworkers + 1),
                stop_barrier: Barrier::new(nworkers + 1),
                stop: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                setup_error: Mutex::new(None),
                metrics: IngestionMetrics::default(),
            }),
        }
    }

    /// Endpoint the server is bound to (available after `start`).
    pub fn local_addr(&self) -> SocketAddr {
        *self.inner.addr.lock()
    }
}

#[async_trait]
impl Server for UdpServer {
    async fn start(&self, sig: &mut SignalHandler, id: u32) -> Result<()> {
        let stopper = self.inner.clone();
        sig.add_action(id, move || stopper.stop());

        // Bind the first socket up front so port 0 resolves before the
        // workers race to join the reuse-port group, and so a bind failure
        // aborts startup with a real error instead of a worker barrier.
        let configured = *self.inner.addr.lock();
        let socket = match setup_socket(configured) {
            Ok(socket) => socket,
            Err(err) => {
                self.inner.stopped.store(true, Ordering::SeqCst);
                return Err(err).with_context(|| format!("can't bind UDP socket {}", configured));
            }
        };
        let resolved = socket.local_addr()?;
        *self.inner.addr.lock() = resolved;
        *self.inner.primary_socket.lock() = Some(socket);

        for i in 0..self.inner.nworkers {
            let inner = self.inner.clone();
            std::thread::Builder::new()
                .name(format!("udp-worker-{}", i))
                .spawn(move || inner.worker())
                .context("can't spawn UDP worker")?;
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.start_barrier.wait()).await?;

        let setup_err = self.inner.setup_error.lock().take();
        if let Some(err) = setup_err {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.stop()).await?;
            bail!("UDP server failed to start: {}", err);
        }
        info!("UDP server started, endpoint: {}", resolved);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn name(&self) -> &'static str {
        "UDP"
    }
}

impl Inner {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::Relaxed);
        self.send_wakeup();
        self.stop_barrier.wait();
        info!(
            "UDP server stopped, packets={}, bytes={}",
            self.metrics.packets(),
            self.metrics.bytes()
        );
    }

    /// Wake a blocked worker with a one-byte datagram to our own endpoint.
    fn send_wakeup(&self) {
        let bound = *self.addr.lock();
        let target = if bound.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        } else {
            bound
        };
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
            Ok(socket) => {
                if let Err(err) = socket.send_to(&[0u8], target) {
                    error!("can't send the stop datagram to {}: {}", target, err);
                }
            }
            Err(err) => error!("can't create the stop socket: {}", err),
        }
    }

    fn worker(&self) {
        let session = self.con.create_session();
        let socket = self.acquire_socket();
        self.start_barrier.wait();
        if let Some(socket) = socket {
            self.recv_loop(&session, &socket);
            // Socket drops here, after the worker has left its last
            // syscall and before the stopper is released.
        }
        self.stop_barrier.wait();
    }

    fn acquire_socket(&self) -> Option<UdpSocket> {
        if let Some(socket) = self.primary_socket.lock().take() {
            return Some(socket);
        }
        let addr = *self.addr.lock();
        match setup_socket(addr) {
            Ok(socket) => Some(socket),
            Err(err) => {
                error!("UDP worker can't open socket {}: {}", addr, err);
                let mut slot = self.setup_error.lock();
                slot.get_or_insert_with(|| err.to_string());
                None
            }
        }
    }

    fn recv_loop(&self, session: &Session, socket: &UdpSocket) {
        let mut bufs = vec![[0u8; MTU]; NPACKETS];
        loop {
            let lengths = match batch_receive(socket, &mut bufs) {
                Ok(lengths) => lengths,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    error!("socket read error: {}", err);
                    break;
                }
            };
            // Check before parsing so the synthetic wake byte is discarded
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            // Zero messages is a legitimate spurious wakeup
            if lengths.is_empty() {
                continue;
            }
            let bytes: usize = lengths.iter().sum();
            self.metrics.record(lengths.len() as u64, bytes as u64);

            // A fresh parser per batch: one bad packet must never corrupt
            // parser state for the batches that follow it.
            let mut parser = RespParser::new(session);
            for (buf, &len) in bufs.iter().zip(lengths.iter()) {
                if let Err(err) = parser.parse_next(&buf[..len]) {
                    match err {
                        IngestError::Parse(err) => {
                            // The parser state is poisoned; refresh it and
                            // keep going with the rest of the batch
                            error!("dropping datagram: {}", err);
                            parser = RespParser::new(session);
                        }
                        IngestError::Database(err) => {
                            error!("dropping batch: {}", err);
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Create a UDP socket in the reuse-port group with a bounded receive
/// timeout.
fn setup_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let SocketAddr::V4(addr) = addr else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "UDP server requires an IPv4 endpoint",
        ));
    };
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Owns the fd from here on; closes it if any later step fails
        let socket = UdpSocket::from_raw_fd(fd);

        let optval: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: RECV_TIMEOUT_USEC,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        let mut sa: libc::sockaddr_in = std::mem::zeroed();
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = addr.port().to_be();
        sa.sin_addr = libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        };
        if libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(socket)
    }
}

/// Receive up to `NPACKETS` datagrams in one syscall, returning their
/// lengths. Blocks until at least one datagram arrives or the receive
/// timeout elapses.
#[cfg(target_os = "linux")]
fn batch_receive(socket: &UdpSocket, bufs: &mut [[u8; MTU]]) -> io::Result<Vec<usize>> {
    let count = bufs.len();
    let mut iovecs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: MTU,
        })
        .collect();
    let mut headers: Vec<libc::mmsghdr> = iovecs
        .iter_mut()
        .map(|iov| {
            let mut header: libc::mmsghdr = unsafe { std::mem::zeroed() };
            header.msg_hdr.msg_iov = iov as *mut libc::iovec;
            header.msg_hdr.msg_iovlen = 1;
            header
        })
        .collect();
    let received = unsafe {
        libc::recvmmsg(
            socket.as_raw_fd(),
            headers.as_mut_ptr(),
            count as libc::c_uint,
            libc::MSG_WAITFORONE,
            std::ptr::null_mut(),
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(headers[..received as usize]
        .iter()
        .map(|header| header.msg_len as usize)
        .collect())
}

/// Single-message fallback where batch receive is unavailable, reported as
/// a one-element batch.
#[cfg(not(target_os = "linux"))]
fn batch_receive(socket: &UdpSocket, bufs: &mut [[u8; MTU]]) -> io::Result<Vec<usize>> {
    let (len, _from) = socket.recv_from(&mut bufs[0])?;
    Ok(vec![len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_socket_rejects_ipv6_endpoints() {
        let err = setup_socket("[::1]:0".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn setup_socket_joins_a_reuse_port_group() {
        let first = setup_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // A second socket can bind the same port thanks to SO_REUSEPORT
        let second = setup_socket(addr).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }

    #[test]
    fn batch_receive_times_out_instead_of_blocking_forever() {
        let socket = setup_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut bufs = vec![[0u8; MTU]; 4];
        let err = batch_receive(&socket, &mut bufs).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut,
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn batch_receive_picks_up_queued_datagrams() {
        let socket = setup_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"one", addr).unwrap();
        sender.send_to(b"two", addr).unwrap();

        let mut bufs = vec![[0u8; MTU]; 4];
        let mut lengths = Vec::new();
        while lengths.len() < 2 {
            match batch_receive(&socket, &mut bufs) {
                Ok(batch) => lengths.extend(batch),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("receive failed: {}", err),
            }
        }
        assert_eq!(lengths, vec![3, 3]);
    }
}
