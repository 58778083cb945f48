//! Authenticated socket layer.
//!
//! A broker owns at most one bind socket (ROUTER, created iff it has
//! children) and at most one parent socket (DEALER, created iff rank > 0).
//! Both run CURVE: the router is the CURVE server consulting the ZAP agent;
//! the dealer is a CURVE client pinned to the parent's public key.
//!
//! The transport fd is edge-triggered: it signals state changes, not level
//! readiness. [`ZmqWatcher`] wraps the canonical integration pattern: a
//! prepare watcher consults the socket's event mask before the poll and arms
//! an idle watcher when work is already pending (so the poll does not
//! block), and a check watcher re-reads the mask after the poll and invokes
//! the socket callback.

use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use tracing::{debug, trace, warn};

use canopy_core::error::{Error, Result};
use canopy_core::message::{Message, MsgFlags};
use canopy_core::reactor::{FdEvents, Reactor, Watcher};

use crate::cert::Certificate;

/// Map a transport error onto the fabric error model. Unroutable peers and
/// full high-water marks both surface as host-unreachable, which the overlay
/// treats as a disconnect.
fn send_error(e: zmq::Error, peer: &str) -> Error {
    match e {
        zmq::Error::EHOSTUNREACH | zmq::Error::EAGAIN => Error::HostUnreachable(peer.to_string()),
        other => Error::Io(std::io::Error::from_raw_os_error(other.to_raw())),
    }
}

fn zmq_io(e: zmq::Error) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(e.to_raw()))
}

/// Owns the transport library context. The ZAP agent is scoped to this
/// context and may be enabled exactly once; see [`crate::zap`].
pub struct TransportContext {
    ctx: zmq::Context,
    zap_enabled: Cell<bool>,
}

impl TransportContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: zmq::Context::new(),
            zap_enabled: Cell::new(false),
        }
    }

    #[must_use]
    pub fn context(&self) -> &zmq::Context {
        &self.ctx
    }

    /// Reserve the single ZAP slot for this context.
    pub(crate) fn claim_zap(&self) -> Result<()> {
        if self.zap_enabled.replace(true) {
            return Err(Error::Exists(
                "ZAP agent already enabled for this context".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Reactor integration for one transport socket.
///
/// The callback runs whenever the socket has input pending; it must drain
/// with nonblocking receives until empty.
pub struct ZmqWatcher {
    prepare: Watcher,
    check: Watcher,
    fd_watcher: Watcher,
    idle: Watcher,
}

impl ZmqWatcher {
    pub fn new(
        reactor: &Reactor,
        socket: Rc<zmq::Socket>,
        cb: Box<dyn FnMut(&Reactor)>,
    ) -> Result<Self> {
        let fd = socket.get_fd().map_err(zmq_io)? as RawFd;

        // The fd and idle watchers exist only to steer the poll; dispatch
        // happens from the check watcher.
        let fd_watcher = reactor.fd_watcher(fd, FdEvents::READABLE, Box::new(|_, _, _| {}));
        fd_watcher.unref_loop();
        let idle = reactor.idle_watcher(Box::new(|_, _, _| {}));
        idle.unref_loop();

        let prep_socket = socket.clone();
        let prep_fd = fd_watcher.clone();
        let prep_idle = idle.clone();
        let prepare = reactor.prepare_watcher(Box::new(move |_, _, _| {
            let ready = prep_socket
                .get_events()
                .map(|e| e.contains(zmq::POLLIN))
                .unwrap_or(false);
            if ready {
                prep_fd.stop();
                let _ = prep_idle.start();
            } else {
                prep_idle.stop();
                let _ = prep_fd.start();
            }
        }));

        let check_socket = socket;
        let check_idle = idle.clone();
        let check_fd = fd_watcher.clone();
        let cb = RefCell::new(cb);
        let check = reactor.check_watcher(Box::new(move |reactor, _, _| {
            check_idle.stop();
            check_fd.stop();
            let ready = check_socket
                .get_events()
                .map(|e| e.contains(zmq::POLLIN))
                .unwrap_or(false);
            if ready {
                // try_borrow guards against a handler spinning the loop back
                // into this same check watcher mid-drain.
                if let Ok(mut cb) = cb.try_borrow_mut() {
                    (cb)(reactor);
                }
            }
        }));

        Ok(Self {
            prepare,
            check,
            fd_watcher,
            idle,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.prepare.start()?;
        self.check.start()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.prepare.stop();
        self.check.stop();
        self.fd_watcher.stop();
        self.idle.stop();
    }

    /// Tear down and drop the watcher callbacks.
    pub fn destroy(&self) {
        self.prepare.destroy();
        self.check.destroy();
        self.fd_watcher.destroy();
        self.idle.destroy();
    }
}

/// The ROUTER side of the tree: bound by any rank with children.
///
/// Mandatory routing is enabled so a send to a vanished peer fails with
/// host-unreachable instead of disappearing.
pub struct BindSocket {
    sock: Rc<zmq::Socket>,
    watcher: ZmqWatcher,
}

impl BindSocket {
    /// Create, configure, and bind the child-facing socket. The callback
    /// fires whenever inbound messages are pending.
    pub fn new(
        tc: &TransportContext,
        reactor: &Reactor,
        uri: &str,
        rank: u32,
        cert: &Certificate,
        cb: Box<dyn FnMut(&Reactor)>,
    ) -> Result<Self> {
        let sock = tc.context().socket(zmq::ROUTER).map_err(zmq_io)?;
        sock.set_identity(rank.to_string().as_bytes()).map_err(zmq_io)?;
        sock.set_router_mandatory(true).map_err(zmq_io)?;
        sock.set_linger(0).map_err(zmq_io)?;
        sock.set_zap_domain("overlay").map_err(zmq_io)?;
        sock.set_curve_server(true).map_err(zmq_io)?;
        sock.set_curve_secretkey(cert.secret_key()?.as_bytes())
            .map_err(zmq_io)?;
        sock.bind(uri).map_err(zmq_io)?;
        debug!(uri, rank, "[transport] bind socket up");

        let sock = Rc::new(sock);
        let watcher = ZmqWatcher::new(reactor, sock.clone(), cb)?;
        watcher.start()?;
        Ok(Self { sock, watcher })
    }

    /// Send a message to the child named by the top route frame; the router
    /// strips that frame to pick the outbound peer.
    pub fn sendmsg(&self, msg: &Message) -> Result<()> {
        let peer = msg
            .last_route()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .unwrap_or_default();
        let frames = msg.to_frames()?;
        trace!(peer, frames = frames.len(), "[transport] router send");
        self.sock
            .send_multipart(frames.iter().map(|f| &f[..]), zmq::DONTWAIT)
            .map_err(|e| send_error(e, &peer))
    }

    /// Nonblocking receive. The sender identity the router prepends is
    /// pushed onto the route stack as the newest hop.
    pub fn recvmsg(&self) -> Result<Option<Message>> {
        let frames = match self.sock.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(zmq_io(e)),
        };
        if frames.len() < 2 {
            return Err(Error::protocol("router message without identity".to_string()));
        }
        let identity = Bytes::from(frames[0].clone());
        let mut msg = Message::from_frames(frames.into_iter().skip(1))?;
        if !msg.has_route_stack() {
            msg.enable_route_stack();
        }
        msg.push_route(identity)?;
        Ok(Some(msg))
    }

    pub fn shutdown(&self) {
        self.watcher.destroy();
    }
}

/// The DEALER side of the tree: one per rank > 0, connected to the parent.
pub struct ParentSocket {
    sock: Rc<zmq::Socket>,
    watcher: ZmqWatcher,
}

impl ParentSocket {
    /// Create, configure, and connect the parent-facing socket.
    pub fn new(
        tc: &TransportContext,
        reactor: &Reactor,
        uri: &str,
        rank: u32,
        cert: &Certificate,
        parent_key: &crate::cert::PublicKey,
        cb: Box<dyn FnMut(&Reactor)>,
    ) -> Result<Self> {
        let sock = tc.context().socket(zmq::DEALER).map_err(zmq_io)?;
        sock.set_identity(rank.to_string().as_bytes()).map_err(zmq_io)?;
        sock.set_linger(0).map_err(zmq_io)?;
        sock.set_curve_serverkey(parent_key.as_bytes()).map_err(zmq_io)?;
        sock.set_curve_publickey(cert.public_key().as_bytes())
            .map_err(zmq_io)?;
        sock.set_curve_secretkey(cert.secret_key()?.as_bytes())
            .map_err(zmq_io)?;
        sock.connect(uri).map_err(zmq_io)?;
        debug!(uri, rank, "[transport] parent socket connecting");

        let sock = Rc::new(sock);
        let watcher = ZmqWatcher::new(reactor, sock.clone(), cb)?;
        watcher.start()?;
        Ok(Self { sock, watcher })
    }

    /// Send a message upstream. Everything crossing a router link carries a
    /// route stack, enabled here if the caller left it off.
    pub fn sendmsg(&self, msg: &Message) -> Result<()> {
        let frames = if msg.flags().contains(MsgFlags::ROUTE) {
            msg.to_frames()?
        } else {
            let mut copy = msg.copy(false);
            copy.enable_route_stack();
            copy.to_frames()?
        };
        trace!(frames = frames.len(), "[transport] dealer send");
        self.sock
            .send_multipart(frames.iter().map(|f| &f[..]), zmq::DONTWAIT)
            .map_err(|e| send_error(e, "parent"))
    }

    /// Nonblocking receive from the parent. No identity is prepended on a
    /// dealer link.
    pub fn recvmsg(&self) -> Result<Option<Message>> {
        let frames = match self.sock.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(zmq_io(e)),
        };
        Ok(Some(Message::from_frames(frames)?))
    }

    pub fn shutdown(&self) {
        self.watcher.destroy();
    }
}

/// Drain helper shared by the receive paths: call `f` for every pending
/// message, logging and dropping protocol violations without disconnecting
/// the peer.
pub fn drain<R, F>(mut recv: R, mut f: F)
where
    R: FnMut() -> Result<Option<Message>>,
    F: FnMut(Message),
{
    loop {
        match recv() {
            Ok(Some(msg)) => f(msg),
            Ok(None) => break,
            Err(Error::Protocol(reason)) => {
                warn!(reason, "[transport] dropping malformed message");
            }
            Err(e) => {
                warn!(error = %e, "[transport] receive failed");
                break;
            }
        }
    }
}
