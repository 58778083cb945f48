//! The overlay routing engine.
//!
//! Binds the codec, transport, topology, and reactor together: decides per
//! message whether to travel upstream, downstream to a specific child, or
//! into local dispatch; tracks per-child liveness off a sync tick; and
//! implements the `overlay.monitor`, `overlay.pause`, and
//! `overlay.stats.get` services.
//!
//! Everything here runs on the reactor thread. State is borrowed only for
//! bookkeeping; message emission always happens with no borrow held, since
//! sending can recurse into local dispatch.

use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use canopy_core::error::{errnum, Error, Result};
use canopy_core::fsd;
use canopy_core::message::{
    uuid_for_rank, KeepaliveStatus, Message, MessageType, MsgFlags, NODEID_ANY,
};
use canopy_core::reactor::Reactor;
use canopy_core::topology::Topology;

use crate::cert::{Certificate, PublicKey};
use crate::sync::SyncTimer;
use crate::transport::{drain, BindSocket, ParentSocket, TransportContext};

/// Destination preference for [`Overlay::sendmsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendWhere {
    /// Route by message content (nodeid, route stack, type).
    Any,
    /// Force the parent link.
    Upstream,
    /// Force the child side (requests by nodeid, events multicast).
    Downstream,
}

/// Static overlay parameters for one broker.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub rank: u32,
    pub size: u32,
    pub fanout: u32,
    /// Child-facing URI; required iff the rank has children.
    pub bind_uri: Option<String>,
    /// Parent URI and public key; required iff rank > 0.
    pub parent_uri: Option<String>,
    pub parent_pubkey: Option<PublicKey>,
    pub sync_min: Duration,
    pub sync_max: Duration,
    /// Send a keepalive upstream after this much send silence.
    pub idle_min: Duration,
    /// Mark a child idle after this much receive silence.
    pub idle_max: Duration,
    pub hostname: Option<String>,
}

impl OverlayConfig {
    #[must_use]
    pub fn new(rank: u32, size: u32, fanout: u32) -> Self {
        Self {
            rank,
            size,
            fanout,
            bind_uri: None,
            parent_uri: None,
            parent_pubkey: None,
            sync_min: Duration::from_secs(1),
            sync_max: Duration::from_secs(10),
            idle_min: Duration::from_secs(5),
            idle_max: Duration::from_secs(30),
            hostname: None,
        }
    }
}

/// Per-child liveness entry, one per direct child in the topology.
#[derive(Debug, Clone)]
struct Peer {
    rank: u32,
    uuid: String,
    last_seen: Instant,
    connected: bool,
    idle: bool,
    test_pause: bool,
}

/// One row of the monitor's children report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerStatus {
    pub rank: u32,
    pub connected: bool,
    pub idle: bool,
}

#[derive(Debug, Clone, Serialize)]
struct MonitorDelta {
    rank: u32,
    connected: bool,
    idle: bool,
    reason: String,
}

struct OverlayState {
    peers: Vec<Peer>,
    last_sent: Instant,
    paused: bool,
    backlog: VecDeque<Message>,
    monitors: Vec<Message>,
    event_seq: u32,
    shut_down: bool,
}

struct OverlayCore {
    reactor: Reactor,
    topo: Topology,
    cfg: OverlayConfig,
    parent_uuid: Option<String>,
    bind: RefCell<Option<BindSocket>>,
    parent: RefCell<Option<ParentSocket>>,
    sync: RefCell<Option<SyncTimer>>,
    state: RefCell<OverlayState>,
    /// Local delivery into broker dispatch. `Fn`, not `FnMut`: delivery can
    /// recurse back into the overlay.
    delivery: RefCell<Option<Rc<dyn Fn(Message)>>>,
    /// Fired with a peer uuid when that child disconnects.
    disconnect_cb: RefCell<Option<Rc<dyn Fn(String)>>>,
}

/// The overlay handle. Cheap to clone.
#[derive(Clone)]
pub struct Overlay {
    core: Rc<OverlayCore>,
}

impl Overlay {
    pub fn new(reactor: &Reactor, cfg: OverlayConfig) -> Result<Self> {
        let topo = Topology::new(cfg.size, cfg.fanout)?;
        if cfg.rank >= cfg.size {
            return Err(Error::invalid(format!(
                "rank {} out of range for size {}",
                cfg.rank, cfg.size
            )));
        }
        let has_children = topo.children_count(cfg.rank)? > 0;
        if has_children && cfg.bind_uri.is_none() {
            return Err(Error::invalid("rank with children needs a bind URI"));
        }
        if cfg.rank > 0 && (cfg.parent_uri.is_none() || cfg.parent_pubkey.is_none()) {
            return Err(Error::invalid("rank > 0 needs a parent URI and key"));
        }

        let now = Instant::now();
        let peers = topo
            .children(cfg.rank)?
            .map(|rank| Peer {
                rank,
                uuid: rank.to_string(),
                last_seen: now,
                connected: false,
                idle: false,
                test_pause: false,
            })
            .collect();
        let parent_uuid = topo.parent(cfg.rank)?.map(|r| r.to_string());

        Ok(Self {
            core: Rc::new(OverlayCore {
                reactor: reactor.clone(),
                topo,
                cfg,
                parent_uuid,
                bind: RefCell::new(None),
                parent: RefCell::new(None),
                sync: RefCell::new(None),
                state: RefCell::new(OverlayState {
                    peers,
                    last_sent: now,
                    paused: false,
                    backlog: VecDeque::new(),
                    monitors: Vec::new(),
                    event_seq: 0,
                    shut_down: false,
                }),
                delivery: RefCell::new(None),
                disconnect_cb: RefCell::new(None),
            }),
        })
    }

    /// Install the local-delivery sink. Must be set before [`start`].
    ///
    /// [`start`]: Overlay::start
    pub fn set_delivery(&self, f: Rc<dyn Fn(Message)>) {
        *self.core.delivery.borrow_mut() = Some(f);
    }

    /// Install the peer-disconnect notification hook.
    pub fn set_disconnect_cb(&self, f: Rc<dyn Fn(String)>) {
        *self.core.disconnect_cb.borrow_mut() = Some(f);
    }

    /// Bring up sockets, announce to the parent, and start the sync tick.
    pub fn start(&self, tc: &TransportContext, cert: &Certificate) -> Result<()> {
        let core = &self.core;
        if core.topo.children_count(core.cfg.rank)? > 0 {
            let uri = core.cfg.bind_uri.as_deref().expect("validated in new");
            let cb_core = core.clone();
            let bind = BindSocket::new(
                tc,
                &core.reactor,
                uri,
                core.cfg.rank,
                cert,
                Box::new(move |_| cb_core.handle_bind_readable()),
            )?;
            *core.bind.borrow_mut() = Some(bind);
        }
        if core.cfg.rank > 0 {
            let uri = core.cfg.parent_uri.as_deref().expect("validated in new");
            let key = core.cfg.parent_pubkey.as_ref().expect("validated in new");
            let cb_core = core.clone();
            let parent = ParentSocket::new(
                tc,
                &core.reactor,
                uri,
                core.cfg.rank,
                cert,
                key,
                Box::new(move |_| cb_core.handle_parent_readable()),
            )?;
            *core.parent.borrow_mut() = Some(parent);

            // Announce so the parent can mark this child connected.
            core.send_parent_direct(&core.keepalive(KeepaliveStatus::Normal))?;
        }

        let sync = SyncTimer::new(&core.reactor, core.cfg.sync_min)?;
        let tick_core = core.clone();
        sync.then(
            core.cfg.sync_max,
            Box::new(move |f| {
                f.reset();
                tick_core.sync_tick();
            }),
        );
        *core.sync.borrow_mut() = Some(sync);
        info!(
            rank = core.cfg.rank,
            size = core.cfg.size,
            fanout = core.cfg.fanout,
            "[overlay] up"
        );
        Ok(())
    }

    /// Route one message. See the module docs for the decision table.
    pub fn sendmsg(&self, msg: Message, where_: SendWhere) -> Result<()> {
        self.core.route_send(msg, where_)
    }

    #[must_use]
    pub fn rank(&self) -> u32 {
        self.core.cfg.rank
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.core.cfg.size
    }

    #[must_use]
    pub fn children_status(&self) -> Vec<PeerStatus> {
        self.core.children_status()
    }

    #[must_use]
    pub fn pending_monitor_count(&self) -> usize {
        self.core.state.borrow().monitors.len()
    }

    // === service entry points, registered as handlers by the broker ===

    /// `overlay.monitor`: one-shot children report, or a streaming
    /// subscription when the request carries the streaming flag.
    pub fn monitor_request(&self, msg: &Message) -> Result<()> {
        let core = &self.core;
        if core.state.borrow().peers.is_empty() {
            return core.respond_error(msg, errnum::ENODATA, "no monitor data on a leaf");
        }
        let payload = serde_json::json!({ "children": core.children_status() });
        if msg.flags().contains(MsgFlags::STREAMING) {
            core.state.borrow_mut().monitors.push(msg.copy(false));
            trace!(rank = core.cfg.rank, "[overlay] monitor subscription added");
        }
        core.respond(msg, &payload)
    }

    /// `overlay.monitor-cancel` (no-response): end one streaming monitor,
    /// matched by matchtag and sender identity.
    pub fn monitor_cancel(&self, msg: &Message) {
        let core = &self.core;
        let Ok(tag) = msg
            .payload_json()
            .and_then(|v| {
                v.get("matchtag")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| Error::protocol("matchtag missing".to_string()))
            })
        else {
            warn!("[overlay] malformed monitor-cancel");
            return;
        };
        let sender = msg.first_route().map(<[u8]>::to_vec).unwrap_or_default();
        let cancelled = {
            let mut state = core.state.borrow_mut();
            take_matching(&mut state.monitors, |m| {
                m.matchtag().is_ok_and(|t| u64::from(t) == tag)
                    && m.first_route().map(<[u8]>::to_vec).unwrap_or_default() == sender
            })
        };
        for original in cancelled {
            let _ = core.respond_error(&original, errnum::ENODATA, "");
        }
    }

    /// `overlay.pause`: test-only toggle. First call intercepts upstream
    /// sends into a backlog and tells the parent to mark this child idle;
    /// second call drains the backlog in order.
    pub fn pause_request(&self, msg: &Message) -> Result<()> {
        let core = &self.core;
        let enabling = {
            let mut state = core.state.borrow_mut();
            state.paused = !state.paused;
            state.paused
        };
        if enabling {
            debug!(rank = core.cfg.rank, "[overlay] paused");
            core.send_parent_direct(&core.keepalive(KeepaliveStatus::TestPause))?;
        } else {
            debug!(rank = core.cfg.rank, "[overlay] resuming");
            loop {
                let queued = core.state.borrow_mut().backlog.pop_front();
                let Some(queued) = queued else { break };
                core.send_parent_direct(&queued)?;
            }
            // Guarantee the parent sees traffic even if nothing was queued.
            core.send_parent_direct(&core.keepalive(KeepaliveStatus::Normal))?;
        }
        if !msg.flags().contains(MsgFlags::NORESPONSE) {
            core.respond(msg, &serde_json::json!({ "paused": enabling }))?;
        }
        Ok(())
    }

    /// `overlay.stats.get`: liveness and bookkeeping counters.
    pub fn stats_request(&self, msg: &Message) -> Result<()> {
        let core = &self.core;
        let (connected, monitor_pending) = {
            let state = core.state.borrow();
            (
                state.peers.iter().filter(|p| p.connected).count(),
                state.monitors.len(),
            )
        };
        let payload = serde_json::json!({
            "rank": core.cfg.rank,
            "size": core.cfg.size,
            "fanout": core.cfg.fanout,
            "hostname": core.cfg.hostname,
            "children": {
                "count": core.state.borrow().peers.len(),
                "connected": connected,
            },
            "monitor": { "pending": monitor_pending },
        });
        core.respond(msg, &payload)
    }

    /// Drop pending monitor subscriptions from a departed sender.
    pub fn handle_disconnect(&self, sender: &[u8]) {
        let dropped = {
            let mut state = self.core.state.borrow_mut();
            take_matching(&mut state.monitors, |m| {
                m.first_route().unwrap_or_default() == sender
            })
        };
        if !dropped.is_empty() {
            debug!(
                count = dropped.len(),
                "[overlay] dropped monitor subscriptions on disconnect"
            );
        }
    }

    /// Announce departure, fail pending subscriptions, and stop the fabric.
    pub fn shutdown(&self) {
        let core = &self.core;
        {
            let mut state = core.state.borrow_mut();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.paused = false;
        }
        if core.cfg.rank > 0 {
            let _ = core.send_parent_direct(&core.keepalive(KeepaliveStatus::Disconnect));
        }
        let pending = std::mem::take(&mut core.state.borrow_mut().monitors);
        for original in pending {
            let _ = core.respond_error(&original, errnum::ENOSYS, "overlay is shutting down");
        }
        if let Some(sync) = core.sync.borrow_mut().take() {
            sync.shutdown();
        }
        if let Some(bind) = core.bind.borrow_mut().take() {
            bind.shutdown();
        }
        if let Some(parent) = core.parent.borrow_mut().take() {
            parent.shutdown();
        }
        info!(rank = core.cfg.rank, "[overlay] down");
    }
}

impl OverlayCore {
    fn uuid(&self) -> String {
        self.cfg.rank.to_string()
    }

    fn keepalive(&self, status: KeepaliveStatus) -> Message {
        let mut msg = Message::create(MessageType::Keepalive);
        msg.set_status(status).expect("keepalive accepts status");
        msg.enable_route_stack();
        msg
    }

    fn children_status(&self) -> Vec<PeerStatus> {
        self.state
            .borrow()
            .peers
            .iter()
            .map(|p| PeerStatus {
                rank: p.rank,
                connected: p.connected,
                idle: p.idle,
            })
            .collect()
    }

    fn deliver_local(&self, msg: Message) {
        let delivery = self.delivery.borrow().clone();
        match delivery {
            Some(f) => f(msg),
            None => warn!("[overlay] no delivery sink; dropping {msg}"),
        }
    }

    // === send paths ===

    fn route_send(&self, msg: Message, where_: SendWhere) -> Result<()> {
        match msg.typ()? {
            MessageType::Request => self.send_request(msg, where_),
            MessageType::Response => self.send_response(msg, where_),
            MessageType::Event => self.send_event(msg, where_),
            // Keepalives travel via the parent socket only.
            MessageType::Keepalive => self.send_parent(msg),
        }
    }

    fn send_request(&self, msg: Message, where_: SendWhere) -> Result<()> {
        match where_ {
            SendWhere::Upstream => return self.send_upstream_request(msg),
            SendWhere::Downstream => {
                let nodeid = msg.nodeid()?;
                let Some(child) = self.topo.child_route(self.cfg.rank, nodeid)? else {
                    return Err(Error::HostUnreachable(format!(
                        "rank {nodeid} is not below rank {}",
                        self.cfg.rank
                    )));
                };
                return self.send_downstream_request(msg, child);
            }
            SendWhere::Any => {}
        }
        let nodeid = msg.nodeid()?;
        if msg.flags().contains(MsgFlags::UPSTREAM) {
            if nodeid == self.cfg.rank {
                return self.send_upstream_request(msg);
            }
            // Crossed its one upstream hop; never send it back down.
            self.deliver_local(msg);
            return Ok(());
        }
        if nodeid == NODEID_ANY || nodeid == self.cfg.rank {
            self.deliver_local(msg);
            return Ok(());
        }
        if nodeid >= self.cfg.size {
            return Err(Error::HostUnreachable(format!(
                "rank {nodeid} outside the instance"
            )));
        }
        match self.topo.child_route(self.cfg.rank, nodeid)? {
            Some(child) => self.send_downstream_request(msg, child),
            None if self.cfg.rank > 0 => self.send_upstream_request(msg),
            None => Err(Error::HostUnreachable(format!(
                "no route from rank 0 to rank {nodeid}"
            ))),
        }
    }

    /// Upstream request push: the local uuid is the return path. The parent
    /// router prepends this same identity on receipt, pops it to identify
    /// the peer, and leaves this frame for the response to unwind.
    fn send_upstream_request(&self, msg: Message) -> Result<()> {
        let mut copy = msg.copy(false);
        if !copy.has_route_stack() {
            copy.enable_route_stack();
        }
        copy.push_route(uuid_for_rank(self.cfg.rank))?;
        self.send_parent(copy)
    }

    /// Downstream request push: local uuid preserves the source path, then
    /// the next hop, which the router strips to pick the peer.
    fn send_downstream_request(&self, msg: Message, child: u32) -> Result<()> {
        let mut copy = msg.copy(false);
        if !copy.has_route_stack() {
            copy.enable_route_stack();
        }
        copy.push_route(uuid_for_rank(self.cfg.rank))?;
        copy.push_route(uuid_for_rank(child))?;
        self.send_child(copy)
    }

    fn send_response(&self, msg: Message, where_: SendWhere) -> Result<()> {
        match where_ {
            SendWhere::Upstream => return self.send_parent(msg),
            SendWhere::Downstream => return self.send_child(msg),
            SendWhere::Any => {}
        }
        match msg.last_route() {
            None => {
                // Fully unwound: the requester is local.
                self.deliver_local(msg);
                Ok(())
            }
            Some(top) => {
                let to_parent = self
                    .parent_uuid
                    .as_ref()
                    .is_some_and(|p| p.as_bytes() == top);
                if to_parent && self.cfg.rank > 0 {
                    self.send_parent(msg)
                } else {
                    self.send_child(msg)
                }
            }
        }
    }

    fn send_event(&self, msg: Message, where_: SendWhere) -> Result<()> {
        match where_ {
            SendWhere::Upstream => {
                let mut msg = msg;
                if !msg.has_route_stack() {
                    // Router links require the route framing.
                    msg.enable_route_stack();
                }
                self.send_parent(msg)
            }
            SendWhere::Downstream => self.multicast_event(&msg),
            SendWhere::Any => {
                if self.cfg.rank > 0 {
                    self.send_event(msg, SendWhere::Upstream)
                } else {
                    self.publish_root(msg)
                }
            }
        }
    }

    /// Rank 0 is the event root: stamp the sequence, deliver locally, and
    /// fan out to the tree.
    fn publish_root(&self, msg: Message) -> Result<()> {
        let mut msg = msg;
        let seq = {
            let mut state = self.state.borrow_mut();
            state.event_seq += 1;
            state.event_seq
        };
        msg.set_sequence(seq)?;
        if msg.has_route_stack() {
            msg.clear_route();
        }
        self.deliver_local(msg.copy(false));
        self.multicast_event(&msg)
    }

    /// Copy per child, push the child uuid, send. A multicast is not
    /// atomic; per-child unreachability marks that child disconnected and
    /// the walk continues.
    fn multicast_event(&self, msg: &Message) -> Result<()> {
        let targets: Vec<(u32, String)> = self
            .state
            .borrow()
            .peers
            .iter()
            .filter(|p| p.connected)
            .map(|p| (p.rank, p.uuid.clone()))
            .collect();
        for (rank, uuid) in targets {
            let mut copy = msg.copy(false);
            if !copy.has_route_stack() {
                copy.enable_route_stack();
            } else {
                copy.clear_route();
            }
            copy.push_route(uuid.clone().into_bytes())?;
            match self.send_child(copy) {
                Ok(()) => {}
                Err(Error::HostUnreachable(_)) => {
                    debug!(rank, "[overlay] multicast target unreachable");
                }
                Err(e) => warn!(rank, error = %e, "[overlay] multicast send failed"),
            }
        }
        Ok(())
    }

    /// Send via the bind socket; unreachable peers transition to
    /// disconnected and notify the monitor.
    fn send_child(&self, msg: Message) -> Result<()> {
        let result = {
            let guard = self.bind.borrow();
            match guard.as_ref() {
                Some(bind) => bind.sendmsg(&msg),
                None => return Err(Error::HostUnreachable("no child socket".to_string())),
            }
        };
        if let Err(Error::HostUnreachable(peer)) = &result {
            let peer = peer.clone();
            self.mark_disconnected(&peer, "send failed");
        }
        result
    }

    /// Send via the parent socket, honoring a test pause.
    fn send_parent(&self, msg: Message) -> Result<()> {
        if self.cfg.rank == 0 {
            return Err(Error::HostUnreachable("rank 0 has no parent".to_string()));
        }
        let intercepted = {
            let mut state = self.state.borrow_mut();
            if state.paused {
                state.backlog.push_back(msg.copy(false));
                true
            } else {
                false
            }
        };
        if intercepted {
            trace!("[overlay] send intercepted by pause");
            return Ok(());
        }
        self.send_parent_direct(&msg)
    }

    /// Parent send that bypasses the pause intercept: keepalives that
    /// announce the pause itself, and backlog drains.
    fn send_parent_direct(&self, msg: &Message) -> Result<()> {
        {
            let guard = self.parent.borrow();
            match guard.as_ref() {
                Some(parent) => parent.sendmsg(msg)?,
                None => return Err(Error::HostUnreachable("no parent socket".to_string())),
            }
        }
        self.state.borrow_mut().last_sent = Instant::now();
        Ok(())
    }

    // === receive paths ===

    fn handle_bind_readable(&self) {
        let mut inbound = Vec::new();
        {
            let guard = self.bind.borrow();
            let Some(bind) = guard.as_ref() else { return };
            drain(|| bind.recvmsg(), |msg| inbound.push(msg));
        }
        for msg in inbound {
            if let Err(e) = self.handle_child_msg(msg) {
                warn!(error = %e, "[overlay] child message dropped");
            }
        }
    }

    fn handle_child_msg(&self, mut msg: Message) -> Result<()> {
        let sender = msg
            .pop_route()?
            .ok_or_else(|| Error::protocol("router message without sender".to_string()))?;
        let typ = msg.typ()?;
        let keepalive_status = if typ == MessageType::Keepalive {
            Some(msg.status()?)
        } else {
            None
        };

        let mut updates = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let Some(peer) = state.peers.iter_mut().find(|p| p.uuid.as_bytes() == &sender[..])
            else {
                return Err(Error::HostUnreachable(format!(
                    "unknown peer {:?}",
                    String::from_utf8_lossy(&sender)
                )));
            };
            peer.last_seen = Instant::now();
            match keepalive_status {
                Some(KeepaliveStatus::Disconnect) => {
                    peer.connected = false;
                    peer.idle = false;
                    peer.test_pause = false;
                    updates.push((
                        peer_delta(peer, "disconnected"),
                        Some(peer.uuid.clone()),
                    ));
                }
                Some(KeepaliveStatus::TestPause) => {
                    if !peer.connected {
                        peer.connected = true;
                        updates.push((peer_delta(peer, "connected"), None));
                    }
                    peer.test_pause = true;
                    if !peer.idle {
                        peer.idle = true;
                        updates.push((peer_delta(peer, "idle for 0s"), None));
                    }
                }
                _ => {
                    if !peer.connected {
                        peer.connected = true;
                        updates.push((peer_delta(peer, "connected"), None));
                    }
                    peer.test_pause = false;
                    if peer.idle {
                        peer.idle = false;
                        updates.push((peer_delta(peer, "no longer idle"), None));
                    }
                }
            }
        }
        for (delta, disconnected_uuid) in updates {
            self.monitor_update(&delta);
            if let Some(uuid) = disconnected_uuid {
                self.fire_disconnect(&uuid);
            }
        }

        match typ {
            MessageType::Keepalive => Ok(()), // never surfaced
            MessageType::Response => {
                // Inverse of the downstream request push: the router gave us
                // the peer uuid, and our own uuid comes off here.
                let own = msg.pop_route()?;
                if own.as_deref() != Some(self.uuid().as_bytes()) {
                    return Err(Error::protocol("response route missing self hop".to_string()));
                }
                if msg.route_count() == 0 {
                    self.deliver_local(msg);
                    Ok(())
                } else {
                    self.route_send(msg, SendWhere::Any)
                }
            }
            MessageType::Request => self.send_request(msg, SendWhere::Any),
            MessageType::Event => {
                if self.cfg.rank > 0 {
                    self.send_event(msg, SendWhere::Upstream)
                } else {
                    self.publish_root(msg)
                }
            }
        }
    }

    fn handle_parent_readable(&self) {
        let mut inbound = Vec::new();
        {
            let guard = self.parent.borrow();
            let Some(parent) = guard.as_ref() else { return };
            drain(|| parent.recvmsg(), |msg| inbound.push(msg));
        }
        for msg in inbound {
            if let Err(e) = self.handle_parent_msg(msg) {
                warn!(error = %e, "[overlay] parent message dropped");
            }
        }
    }

    fn handle_parent_msg(&self, mut msg: Message) -> Result<()> {
        match msg.typ()? {
            MessageType::Keepalive => {
                Err(Error::protocol("keepalive arrived from parent".to_string()))
            }
            MessageType::Event => {
                // Hop identifiers above us are stale here.
                if msg.has_route_stack() {
                    msg.clear_route();
                }
                self.deliver_local(msg.copy(false));
                self.multicast_event(&msg)
            }
            MessageType::Response => {
                if msg.route_count() == 0 {
                    self.deliver_local(msg);
                    Ok(())
                } else {
                    self.route_send(msg, SendWhere::Any)
                }
            }
            MessageType::Request => self.send_request(msg, SendWhere::Any),
        }
    }

    // === liveness ===

    fn sync_tick(&self) {
        let now = Instant::now();
        let (send_keepalive, mut deltas) = {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return;
            }
            let send_keepalive = self.cfg.rank > 0
                && now.duration_since(state.last_sent) >= self.cfg.idle_min;
            let mut deltas = Vec::new();
            for peer in &mut state.peers {
                if !peer.connected || peer.idle {
                    continue;
                }
                let silent = now.duration_since(peer.last_seen);
                if peer.test_pause || silent >= self.cfg.idle_max {
                    peer.idle = true;
                    deltas.push(peer_delta(
                        peer,
                        &format!("idle for {}", fsd::format(silent)),
                    ));
                }
            }
            (send_keepalive, deltas)
        };
        if send_keepalive {
            if let Err(e) = self.send_parent(self.keepalive(KeepaliveStatus::Normal)) {
                warn!(error = %e, "[overlay] keepalive send failed");
            }
        }
        for delta in deltas.drain(..) {
            self.monitor_update(&delta);
        }
    }

    fn mark_disconnected(&self, uuid: &str, why: &str) {
        let delta = {
            let mut state = self.state.borrow_mut();
            let Some(peer) = state.peers.iter_mut().find(|p| p.uuid == uuid) else {
                return;
            };
            if !peer.connected {
                return;
            }
            peer.connected = false;
            peer.idle = false;
            peer.test_pause = false;
            debug!(rank = peer.rank, why, "[overlay] child disconnected");
            peer_delta(peer, "disconnected")
        };
        self.monitor_update(&delta);
        self.fire_disconnect(uuid);
    }

    fn fire_disconnect(&self, uuid: &str) {
        let cb = self.disconnect_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(uuid.to_string());
        }
    }

    /// Emit one delta to every streaming monitor subscription.
    fn monitor_update(&self, delta: &MonitorDelta) {
        let subscribers: Vec<Message> = self.state.borrow().monitors.to_vec();
        for original in subscribers {
            if let Err(e) = self.respond_json(&original, delta) {
                warn!(error = %e, "[overlay] monitor update failed");
            }
        }
    }

    // === response helpers ===

    fn respond(&self, req: &Message, payload: &serde_json::Value) -> Result<()> {
        self.respond_json(req, payload)
    }

    fn respond_json<T: Serialize>(&self, req: &Message, payload: &T) -> Result<()> {
        if req.flags().contains(MsgFlags::NORESPONSE) {
            return Err(Error::invalid("request does not expect a response"));
        }
        let mut rsp = Message::response_for(req)?;
        rsp.set_payload_json(payload)?;
        self.route_send(rsp, SendWhere::Any)
    }

    fn respond_error(&self, req: &Message, code: i32, text: &str) -> Result<()> {
        if req.flags().contains(MsgFlags::NORESPONSE) {
            return Err(Error::invalid("request does not expect a response"));
        }
        let mut rsp = Message::response_for(req)?;
        rsp.set_errnum(code)?;
        if !text.is_empty() {
            rsp.set_payload_string(text);
        }
        self.route_send(rsp, SendWhere::Any)
    }
}

fn peer_delta(peer: &Peer, reason: &str) -> MonitorDelta {
    MonitorDelta {
        rank: peer.rank,
        connected: peer.connected,
        idle: peer.idle,
        reason: reason.to_string(),
    }
}

/// Drain the elements matching `pred` out of `v`, preserving order.
fn take_matching<T>(v: &mut Vec<T>, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
    let mut taken = Vec::new();
    let mut i = 0;
    while i < v.len() {
        if pred(&v[i]) {
            taken.push(v.remove(i));
        } else {
            i += 1;
        }
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_overlay() -> (Reactor, Overlay) {
        let reactor = Reactor::new().unwrap();
        // Rank 0 of a single-node instance: no sockets needed at all.
        let overlay = Overlay::new(&reactor, OverlayConfig::new(0, 1, 2)).unwrap();
        (reactor, overlay)
    }

    #[test]
    fn config_validation() {
        let reactor = Reactor::new().unwrap();
        // Rank 0 of size 7 has children: bind URI required.
        assert!(Overlay::new(&reactor, OverlayConfig::new(0, 7, 2)).is_err());
        // Rank 3 of size 7 with fanout 2 is a leaf but needs parent info.
        assert!(Overlay::new(&reactor, OverlayConfig::new(3, 7, 2)).is_err());
        // Out-of-range rank.
        assert!(Overlay::new(&reactor, OverlayConfig::new(9, 7, 2)).is_err());
        // Single-node instance needs nothing.
        assert!(Overlay::new(&reactor, OverlayConfig::new(0, 1, 2)).is_ok());
    }

    #[test]
    fn local_requests_deliver_locally() {
        let (_reactor, overlay) = leaf_overlay();
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let sink = delivered.clone();
        overlay.set_delivery(Rc::new(move |msg: Message| {
            sink.borrow_mut().push(msg.topic().unwrap_or("").to_string());
        }));

        let msg = Message::request("svc.method").unwrap();
        overlay.sendmsg(msg, SendWhere::Any).unwrap();

        let mut addressed = Message::request("svc.other").unwrap();
        addressed.set_nodeid(0).unwrap();
        overlay.sendmsg(addressed, SendWhere::Any).unwrap();

        assert_eq!(*delivered.borrow(), vec!["svc.method", "svc.other"]);
    }

    #[test]
    fn out_of_range_nodeid_is_unreachable() {
        let (_reactor, overlay) = leaf_overlay();
        overlay.set_delivery(Rc::new(|_| {}));
        let mut msg = Message::request("svc.x").unwrap();
        msg.set_nodeid(42).unwrap();
        let err = overlay.sendmsg(msg, SendWhere::Any).unwrap_err();
        assert_eq!(err.errnum(), errnum::EHOSTUNREACH);
    }

    #[test]
    fn leaf_monitor_fails_with_nodata() {
        let (_reactor, overlay) = leaf_overlay();
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let sink = delivered.clone();
        overlay.set_delivery(Rc::new(move |msg: Message| {
            sink.borrow_mut().push(msg);
        }));

        let mut req = Message::request("overlay.monitor").unwrap();
        req.set_matchtag(3).unwrap();
        overlay.monitor_request(&req).unwrap();

        let responses = delivered.borrow();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].errnum().unwrap(), errnum::ENODATA);
        assert_eq!(responses[0].matchtag().unwrap(), 3);
    }

    #[test]
    fn take_matching_preserves_order() {
        let mut v = vec![1, 2, 3, 4, 5, 6];
        let taken = take_matching(&mut v, |x| x % 2 == 0);
        assert_eq!(taken, vec![2, 4, 6]);
        assert_eq!(v, vec![1, 3, 5]);
    }

    #[test]
    fn event_root_stamps_sequence() {
        let (_reactor, overlay) = leaf_overlay();
        let seqs = Rc::new(RefCell::new(Vec::new()));
        let sink = seqs.clone();
        overlay.set_delivery(Rc::new(move |msg: Message| {
            sink.borrow_mut().push(msg.sequence().unwrap());
        }));

        for _ in 0..3 {
            let mut ev = Message::create(MessageType::Event);
            ev.set_topic("heartbeat").unwrap();
            overlay.sendmsg(ev, SendWhere::Any).unwrap();
        }
        assert_eq!(*seqs.borrow(), vec![1, 2, 3]);
    }
}
