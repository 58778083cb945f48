//! Broker assembly.
//!
//! A broker is one process in the overlay: reactor, transport, overlay
//! routing, dispatch, and the built-in services wired together. The
//! [`BrokerBuilder`] takes the bootstrap facts (rank, size, fanout, URIs,
//! certificate, authorized peers) and produces a ready-to-run [`Broker`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use canopy_core::error::{errnum, Error, Result};
use canopy_core::fsd;
use canopy_core::future::Future;
use canopy_core::hostlist::Hostlist;
use canopy_core::message::{Message, MessageType, MsgFlags, RoleMask, NODEID_ANY};
use canopy_core::reactor::{FdEvents, Reactor, Watcher};
use canopy_fabric::cert::{CertStore, Certificate, PublicKey};
use canopy_fabric::dispatch::{Dispatcher, HandlerId, TypeMask, Verdict};
use canopy_fabric::overlay::{Overlay, OverlayConfig, SendWhere};
use canopy_fabric::transport::TransportContext;
use canopy_fabric::zap::ZapAgent;

use crate::scratchpad::Scratchpad;

/// A future resolving to response messages.
pub type RpcFuture = Future<Message>;

/// Request destination, resolved onto the wire nodeid and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nodeid {
    /// Wherever the service lives: local first, then upstream.
    Any,
    /// The first broker above this one.
    Upstream,
    /// A specific rank.
    Rank(u32),
}

/// Builder for one broker's bootstrap facts.
pub struct BrokerBuilder {
    rank: u32,
    size: u32,
    fanout: u32,
    bind_uri: Option<String>,
    parent_uri: Option<String>,
    parent_pubkey: Option<PublicKey>,
    certificate: Option<Certificate>,
    authorized: Vec<(String, PublicKey)>,
    hosts: Option<Hostlist>,
    sync_min: Duration,
    sync_max: Duration,
    idle_min: Duration,
    idle_max: Duration,
}

impl BrokerBuilder {
    #[must_use]
    pub fn new(rank: u32, size: u32) -> Self {
        Self {
            rank,
            size,
            fanout: 2,
            bind_uri: None,
            parent_uri: None,
            parent_pubkey: None,
            certificate: None,
            authorized: Vec::new(),
            hosts: None,
            sync_min: Duration::from_secs(1),
            sync_max: Duration::from_secs(10),
            idle_min: Duration::from_secs(5),
            idle_max: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn fanout(mut self, fanout: u32) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn bind_uri(mut self, uri: impl Into<String>) -> Self {
        self.bind_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn parent(mut self, uri: impl Into<String>, pubkey: PublicKey) -> Self {
        self.parent_uri = Some(uri.into());
        self.parent_pubkey = Some(pubkey);
        self
    }

    #[must_use]
    pub fn certificate(mut self, cert: Certificate) -> Self {
        self.certificate = Some(cert);
        self
    }

    /// Authorize a peer's public key for inbound sessions.
    #[must_use]
    pub fn authorize(mut self, name: impl Into<String>, pubkey: PublicKey) -> Self {
        self.authorized.push((name.into(), pubkey));
        self
    }

    /// Name the ranks of the instance; rank r takes the r-th hostname.
    #[must_use]
    pub fn hosts(mut self, hosts: Hostlist) -> Self {
        self.hosts = Some(hosts);
        self
    }

    /// Liveness intervals as FSD strings: sync tick min/max, keepalive
    /// threshold, and child idle threshold.
    pub fn liveness_fsd(
        mut self,
        sync_min: &str,
        sync_max: &str,
        idle_min: &str,
        idle_max: &str,
    ) -> Result<Self> {
        self.sync_min = fsd::parse(sync_min)?;
        self.sync_max = fsd::parse(sync_max)?;
        self.idle_min = fsd::parse(idle_min)?;
        self.idle_max = fsd::parse(idle_max)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Broker> {
        let reactor = Reactor::new()?;
        let tc = TransportContext::new();
        let cert = self
            .certificate
            .ok_or_else(|| Error::invalid("broker needs a certificate"))?;

        let mut cfg = OverlayConfig::new(self.rank, self.size, self.fanout);
        cfg.bind_uri = self.bind_uri;
        cfg.parent_uri = self.parent_uri;
        cfg.parent_pubkey = self.parent_pubkey;
        cfg.sync_min = self.sync_min;
        cfg.sync_max = self.sync_max;
        cfg.idle_min = self.idle_min;
        cfg.idle_max = self.idle_max;
        cfg.hostname = self
            .hosts
            .as_ref()
            .and_then(|h| h.nth(self.rank as usize))
            .map(str::to_string);

        let has_children = cfg.bind_uri.is_some();
        let overlay = Overlay::new(&reactor, cfg)?;

        // The ZAP agent must exist before the bind socket accepts sessions;
        // with an empty store it denies everyone, which is the safe default.
        let zap = if has_children {
            let mut store = CertStore::new();
            for (name, key) in &self.authorized {
                store.authorize(name.clone(), key);
            }
            Some(ZapAgent::new(
                &tc,
                &reactor,
                Rc::new(RefCell::new(store)),
            )?)
        } else {
            None
        };

        // Cross-thread call plumbing.
        let (remote_rx, remote_tx) = UnixStream::pair()?;
        remote_rx.set_nonblocking(true)?;
        remote_tx.set_nonblocking(true)?;

        let core = Rc::new(BrokerCore {
            reactor: reactor.clone(),
            tc,
            overlay: overlay.clone(),
            dispatcher: RefCell::new(Dispatcher::new()),
            zap: RefCell::new(zap),
            services: RefCell::new(Vec::new()),
            shutdown_hooks: RefCell::new(Vec::new()),
            remote_queue: Arc::new(Mutex::new(VecDeque::new())),
            remote_tx: Arc::new(remote_tx),
            remote_rx: RefCell::new(Some(remote_rx)),
            remote_watcher: RefCell::new(None),
            shut_down: Cell::new(false),
        });
        let broker = Broker { core: core.clone() };

        // Local delivery and peer-disconnect fan-in.
        let weak = Rc::downgrade(&core);
        overlay.set_delivery(Rc::new(move |msg| {
            if let Some(core) = weak.upgrade() {
                Broker { core }.deliver(msg);
            }
        }));
        let weak = Rc::downgrade(&core);
        overlay.set_disconnect_cb(Rc::new(move |uuid| {
            if let Some(core) = weak.upgrade() {
                Broker { core }.peer_disconnect(&uuid);
            }
        }));

        broker.install_overlay_services();
        Scratchpad::install(&broker)?;
        broker.install_remote_watcher()?;

        broker.core.overlay.start(&broker.core.tc, &cert)?;
        info!(rank = self.rank, size = self.size, "[broker] built");
        Ok(broker)
    }
}

type RemoteTask = Box<dyn FnOnce(&Broker) + Send>;

struct BrokerCore {
    reactor: Reactor,
    tc: TransportContext,
    overlay: Overlay,
    dispatcher: RefCell<Dispatcher>,
    zap: RefCell<Option<ZapAgent>>,
    /// Service names that receive `<service>.disconnect` fan-in.
    services: RefCell<Vec<String>>,
    shutdown_hooks: RefCell<Vec<Box<dyn Fn()>>>,
    remote_queue: Arc<Mutex<VecDeque<RemoteTask>>>,
    remote_tx: Arc<UnixStream>,
    remote_rx: RefCell<Option<UnixStream>>,
    remote_watcher: RefCell<Option<Watcher>>,
    shut_down: Cell<bool>,
}

/// One broker process. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Broker {
    core: Rc<BrokerCore>,
}

/// Non-owning broker handle for handler closures.
#[derive(Clone)]
pub struct WeakBroker(Weak<BrokerCore>);

impl WeakBroker {
    #[must_use]
    pub fn upgrade(&self) -> Option<Broker> {
        self.0.upgrade().map(|core| Broker { core })
    }
}

impl Broker {
    #[must_use]
    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker(Rc::downgrade(&self.core))
    }

    #[must_use]
    pub fn reactor(&self) -> Reactor {
        self.core.reactor.clone()
    }

    #[must_use]
    pub fn overlay(&self) -> Overlay {
        self.core.overlay.clone()
    }

    #[must_use]
    pub fn rank(&self) -> u32 {
        self.core.overlay.rank()
    }

    /// A `Send + Clone` handle for scheduling closures onto this broker's
    /// reactor thread.
    #[must_use]
    pub fn remote(&self) -> Remote {
        Remote {
            queue: self.core.remote_queue.clone(),
            tx: self.core.remote_tx.clone(),
        }
    }

    /// Run the reactor until shutdown.
    pub fn run(&self) -> Result<()> {
        self.core.reactor.run()
    }

    /// Announce departure, fail pending work, and stop the loop.
    pub fn shutdown(&self) {
        if self.core.shut_down.replace(true) {
            return;
        }
        debug!(rank = self.rank(), "[broker] shutting down");
        for hook in self.core.shutdown_hooks.borrow().iter() {
            hook();
        }
        self.core
            .dispatcher
            .borrow_mut()
            .fail_all(errnum::ENOSYS, "broker is shutting down");
        self.core.overlay.shutdown();
        if let Some(zap) = self.core.zap.borrow_mut().take() {
            zap.shutdown();
        }
        if let Some(w) = self.core.remote_watcher.borrow_mut().take() {
            w.destroy();
        }
        self.core.reactor.stop();
    }

    /// Register a shutdown hook, run before the fabric goes down.
    pub fn at_shutdown(&self, hook: Box<dyn Fn()>) {
        self.core.shutdown_hooks.borrow_mut().push(hook);
    }

    // === service registration ===

    /// Register a handler and record the service name for disconnect
    /// fan-in.
    pub fn register_service(
        &self,
        service: &str,
        method_glob: &str,
        types: TypeMask,
        rolemask: RoleMask,
        cb: Box<dyn FnMut(&Message)>,
    ) -> HandlerId {
        {
            let mut services = self.core.services.borrow_mut();
            if !services.iter().any(|s| s == service) {
                services.push(service.to_string());
            }
        }
        let glob = format!("{service}.{method_glob}");
        self.core
            .dispatcher
            .borrow_mut()
            .register(types, glob, rolemask, cb)
    }

    /// Register a bare handler with no service bookkeeping.
    pub fn register_handler(
        &self,
        types: TypeMask,
        glob: &str,
        rolemask: RoleMask,
        cb: Box<dyn FnMut(&Message)>,
    ) -> HandlerId {
        self.core
            .dispatcher
            .borrow_mut()
            .register(types, glob, rolemask, cb)
    }

    pub fn deregister_handler(&self, id: HandlerId) {
        self.core.dispatcher.borrow_mut().deregister(id);
    }

    // === messaging ===

    /// Route a message into the overlay (or straight to local dispatch).
    pub fn sendmsg(&self, msg: Message, where_: SendWhere) -> Result<()> {
        self.core.overlay.sendmsg(msg, where_)
    }

    fn new_request(
        &self,
        topic: &str,
        payload: Option<&serde_json::Value>,
        nodeid: Nodeid,
    ) -> Result<Message> {
        let mut msg = Message::request(topic)?;
        match nodeid {
            Nodeid::Any => msg.set_nodeid(NODEID_ANY)?,
            Nodeid::Rank(r) => msg.set_nodeid(r)?,
            Nodeid::Upstream => {
                msg.set_nodeid(self.rank())?;
                msg.set_flag(MsgFlags::UPSTREAM)?;
            }
        }
        if let Some(payload) = payload {
            msg.set_payload_json(payload)?;
        }
        Ok(msg)
    }

    /// Issue a request expecting exactly one response.
    pub fn rpc(
        &self,
        topic: &str,
        payload: Option<&serde_json::Value>,
        nodeid: Nodeid,
    ) -> Result<RpcFuture> {
        self.rpc_inner(topic, payload, nodeid, false).map(|(f, _)| f)
    }

    /// Issue a streaming request. Returns the future and the matchtag the
    /// caller needs for retries or cancellation.
    pub fn rpc_streaming(
        &self,
        topic: &str,
        payload: Option<&serde_json::Value>,
        nodeid: Nodeid,
    ) -> Result<(RpcFuture, u32)> {
        self.rpc_inner(topic, payload, nodeid, true)
    }

    fn rpc_inner(
        &self,
        topic: &str,
        payload: Option<&serde_json::Value>,
        nodeid: Nodeid,
        streaming: bool,
    ) -> Result<(RpcFuture, u32)> {
        let mut msg = self.new_request(topic, payload, nodeid)?;
        if streaming {
            msg.set_flag(MsgFlags::STREAMING)?;
        }
        let future: RpcFuture = Future::new(&self.core.reactor);
        let tag = self
            .core
            .dispatcher
            .borrow_mut()
            .register_rpc(future.clone(), streaming)?;
        msg.set_matchtag(tag)?;
        trace!(topic, tag, "[broker] rpc");
        if let Err(e) = self.sendmsg(msg, SendWhere::Any) {
            self.core.dispatcher.borrow_mut().forget_rpc(tag);
            return Err(e);
        }
        Ok((future, tag))
    }

    /// Fire-and-forget request; the service must not reply.
    pub fn request_noreply(
        &self,
        topic: &str,
        payload: Option<&serde_json::Value>,
        nodeid: Nodeid,
    ) -> Result<()> {
        let mut msg = self.new_request(topic, payload, nodeid)?;
        msg.set_flag(MsgFlags::NORESPONSE)?;
        self.sendmsg(msg, SendWhere::Any)
    }

    /// Abandon a streaming RPC: send the service's cancel topic the original
    /// matchtag, then release the local tag.
    pub fn rpc_cancel(&self, cancel_topic: &str, nodeid: Nodeid, tag: u32) -> Result<()> {
        self.request_noreply(
            cancel_topic,
            Some(&serde_json::json!({ "matchtag": tag })),
            nodeid,
        )?;
        self.core.dispatcher.borrow_mut().forget_rpc(tag);
        Ok(())
    }

    /// Publish an event into the instance.
    pub fn publish_event(
        &self,
        topic: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        let mut msg = Message::create(MessageType::Event);
        msg.set_topic(topic)?;
        if let Some(payload) = payload {
            msg.set_payload_json(payload)?;
        }
        self.sendmsg(msg, SendWhere::Any)
    }

    /// Respond to a request with a JSON payload.
    pub fn respond<T: serde::Serialize>(&self, req: &Message, payload: &T) -> Result<()> {
        if req.flags().contains(MsgFlags::NORESPONSE) {
            return Err(Error::invalid("request does not expect a response"));
        }
        let mut rsp = Message::response_for(req)?;
        rsp.set_payload_json(payload)?;
        self.sendmsg(rsp, SendWhere::Any)
    }

    /// Respond to a request with an empty success.
    pub fn respond_empty(&self, req: &Message) -> Result<()> {
        if req.flags().contains(MsgFlags::NORESPONSE) {
            return Err(Error::invalid("request does not expect a response"));
        }
        let rsp = Message::response_for(req)?;
        self.sendmsg(rsp, SendWhere::Any)
    }

    /// Respond to a request with an error code and optional text.
    pub fn respond_error(&self, req: &Message, code: i32, text: &str) -> Result<()> {
        if req.flags().contains(MsgFlags::NORESPONSE) {
            return Err(Error::invalid("request does not expect a response"));
        }
        let mut rsp = Message::response_for(req)?;
        rsp.set_errnum(code)?;
        if !text.is_empty() {
            rsp.set_payload_string(text);
        }
        self.sendmsg(rsp, SendWhere::Any)
    }

    // === local delivery ===

    fn deliver(&self, msg: Message) {
        match msg.typ() {
            Ok(MessageType::Response) => {
                let routed = self.core.dispatcher.borrow_mut().dispatch_response(&msg);
                if !routed && msg.matchtag().unwrap_or(0) != 0 {
                    debug!(%msg, "[broker] uncorrelated response dropped");
                }
            }
            Ok(MessageType::Request) => self.deliver_request(msg),
            Ok(MessageType::Event) => {
                let verdict = self.core.dispatcher.borrow().verdict(&msg);
                if let Verdict::Matched(id) = verdict {
                    Dispatcher::run_handler(&self.core.dispatcher, id, &msg);
                }
            }
            Ok(MessageType::Keepalive) | Err(_) => {
                warn!("[broker] undeliverable message dropped");
            }
        }
    }

    fn deliver_request(&self, msg: Message) {
        let verdict = self.core.dispatcher.borrow().verdict(&msg);
        match verdict {
            Verdict::Matched(id) => Dispatcher::run_handler(&self.core.dispatcher, id, &msg),
            Verdict::PermissionDenied => {
                debug!(topic = msg.topic().unwrap_or(""), "[broker] permission denied");
                if !msg.flags().contains(MsgFlags::NORESPONSE) {
                    let _ = self.respond_error(&msg, errnum::EPERM, "permission denied");
                }
            }
            Verdict::NoMatch => self.deliver_unmatched(msg),
        }
    }

    /// Unmatched requests climb the tree when they may be served above;
    /// otherwise the answer is "no such service".
    fn deliver_unmatched(&self, msg: Message) {
        let topic = msg.topic().unwrap_or("").to_string();
        let climbs = self.rank() > 0
            && (msg.nodeid().unwrap_or(0) == NODEID_ANY
                || msg.flags().contains(MsgFlags::UPSTREAM));
        if climbs {
            trace!(topic, "[broker] forwarding unmatched request upstream");
            if let Err(e) = self.sendmsg(msg, SendWhere::Upstream) {
                warn!(topic, error = %e, "[broker] upstream forward failed");
            }
            return;
        }
        debug!(topic, "[broker] no such service");
        if !msg.flags().contains(MsgFlags::NORESPONSE) {
            let _ = self.respond_error(
                &msg,
                errnum::ENOSYS,
                &format!("no service matching {topic} is registered"),
            );
        }
    }

    /// Fan a peer's departure out to every registered service.
    fn peer_disconnect(&self, uuid: &str) {
        let services = self.core.services.borrow().clone();
        debug!(uuid, services = services.len(), "[broker] peer disconnect fan-in");
        for service in services {
            let mut msg = match Message::request(&format!("{service}.disconnect")) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            // Pin to this rank so an unhandled notification never climbs.
            let _ = msg.set_nodeid(self.rank());
            let _ = msg.set_flag(MsgFlags::NORESPONSE);
            msg.enable_route_stack();
            let _ = msg.push_route(uuid.as_bytes().to_vec());
            self.deliver(msg);
        }
    }

    // === built-in services ===

    fn install_overlay_services(&self) {
        let overlay = self.core.overlay.clone();
        let wb = self.downgrade();
        self.register_service(
            "overlay",
            "monitor",
            TypeMask::REQUEST,
            RoleMask::ALL,
            Box::new(move |msg| {
                if let Err(e) = overlay.monitor_request(msg) {
                    if let Some(b) = wb.upgrade() {
                        let _ = b.respond_error(msg, e.errnum(), &e.to_string());
                    }
                }
            }),
        );

        let overlay = self.core.overlay.clone();
        self.register_handler(
            TypeMask::REQUEST,
            "overlay.monitor-cancel",
            RoleMask::ALL,
            Box::new(move |msg| overlay.monitor_cancel(msg)),
        );

        let overlay = self.core.overlay.clone();
        let wb = self.downgrade();
        self.register_handler(
            TypeMask::REQUEST,
            "overlay.pause",
            RoleMask::OWNER,
            Box::new(move |msg| {
                if let Err(e) = overlay.pause_request(msg) {
                    warn!(error = %e, "[broker] pause toggle failed");
                    if let Some(b) = wb.upgrade() {
                        if !msg.flags().contains(MsgFlags::NORESPONSE) {
                            let _ = b.respond_error(msg, e.errnum(), &e.to_string());
                        }
                    }
                }
            }),
        );

        let overlay = self.core.overlay.clone();
        let wb = self.downgrade();
        self.register_handler(
            TypeMask::REQUEST,
            "overlay.stats.get",
            RoleMask::ALL,
            Box::new(move |msg| {
                if let Err(e) = overlay.stats_request(msg) {
                    if let Some(b) = wb.upgrade() {
                        let _ = b.respond_error(msg, e.errnum(), &e.to_string());
                    }
                }
            }),
        );

        let overlay = self.core.overlay.clone();
        self.register_handler(
            TypeMask::REQUEST,
            "overlay.disconnect",
            RoleMask::ALL,
            Box::new(move |msg| {
                overlay.handle_disconnect(msg.first_route().unwrap_or_default());
            }),
        );
    }

    fn install_remote_watcher(&self) -> Result<()> {
        let rx = self
            .core
            .remote_rx
            .borrow_mut()
            .take()
            .expect("installed once");
        let fd = rx.as_raw_fd();
        let queue = self.core.remote_queue.clone();
        let weak = self.downgrade();
        let watcher = self.core.reactor.fd_watcher(
            fd,
            FdEvents::READABLE,
            Box::new(move |_, _, _| {
                let mut rx = &rx;
                let mut buf = [0u8; 64];
                while matches!(rx.read(&mut buf), Ok(n) if n > 0) {}
                loop {
                    let task = queue.lock().expect("remote queue poisoned").pop_front();
                    let Some(task) = task else { break };
                    if let Some(broker) = weak.upgrade() {
                        task(&broker);
                    }
                }
            }),
        );
        watcher.start()?;
        // The remote pipe alone must not keep a finished broker alive.
        watcher.unref_loop();
        *self.core.remote_watcher.borrow_mut() = Some(watcher);
        Ok(())
    }
}

/// Cross-thread handle: schedule closures onto the broker's reactor thread.
#[derive(Clone)]
pub struct Remote {
    queue: Arc<Mutex<VecDeque<RemoteTask>>>,
    tx: Arc<UnixStream>,
}

impl Remote {
    /// Enqueue `f` to run on the broker thread with the broker in scope.
    pub fn call(&self, f: impl FnOnce(&Broker) + Send + 'static) {
        self.queue
            .lock()
            .expect("remote queue poisoned")
            .push_back(Box::new(f));
        let _ = (&*self.tx).write(&[1]);
    }
}

/// Client-side append helper: read, append, store-conditional, retrying on
/// version conflicts. Blocks the calling handler's view of the loop via
/// nested reactor turns, so use it from driver contexts only.
pub fn update_array(
    broker: &Broker,
    nodeid: Nodeid,
    key: &str,
    element: &serde_json::Value,
    timeout: Duration,
) -> Result<u32> {
    loop {
        let rsp = broker
            .rpc(
                "scratchpad.ll",
                Some(&serde_json::json!({ "key": key })),
                nodeid,
            )?
            .wait_within(timeout)?;
        let value = rsp.payload_json()?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::protocol("ll response missing version".to_string()))?
            as u32;
        let mut data = match value.get("data") {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        data.push(element.clone());

        let attempt = broker
            .rpc(
                "scratchpad.sc",
                Some(&serde_json::json!({
                    "key": key,
                    "version": version,
                    "data": data,
                })),
                nodeid,
            )?
            .wait_within(timeout);
        match attempt {
            Ok(_) => return Ok(version + 1),
            Err(e) if e.is_retryable() => continue,
            Err(e) => return Err(e),
        }
    }
}
