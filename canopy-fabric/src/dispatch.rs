//! Topic-based message dispatch.
//!
//! Handlers register as `(type mask, topic glob, required rolemask,
//! callback)`. The registry is consulted in insertion order and the first
//! match wins. Requests that expect a response draw a matchtag; responses
//! route back to their pending future by tag, which is consumed on
//! non-streaming completion and held for streaming RPCs until a terminal
//! status arrives.

use hashbrown::HashMap;
use tracing::trace;

use canopy_core::error::{Error, Result};
use canopy_core::future::Future;
use canopy_core::idset::IdSet;
use canopy_core::message::{Message, MessageType, RoleMask, MATCHTAG_NONE};

/// Set of message types a handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeMask(u8);

impl TypeMask {
    pub const REQUEST: Self = Self(MessageType::Request as u8);
    pub const RESPONSE: Self = Self(MessageType::Response as u8);
    pub const EVENT: Self = Self(MessageType::Event as u8);
    pub const KEEPALIVE: Self = Self(MessageType::Keepalive as u8);
    pub const ANY: Self = Self(0x0f);

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn accepts(self, typ: MessageType) -> bool {
        self.0 & typ as u8 != 0
    }
}

/// Shell-style topic matching: `*`, `?`, `[...]` with ranges and `[!...]`
/// negation. An empty pattern matches everything.
#[must_use]
pub fn topic_match(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    glob_match(pattern.as_bytes(), topic.as_bytes())
}

fn glob_match(pat: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    // Backtrack points for the most recent '*'.
    let (mut star, mut mark) = (usize::MAX, 0usize);

    while t < text.len() {
        if p < pat.len() {
            match pat[p] {
                b'*' => {
                    star = p;
                    mark = t;
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = class_match(pat, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        // Mismatch: retry from the last '*', consuming one more byte.
        if star != usize::MAX {
            p = star + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

/// Match one `[...]` class at `pat[start]`. Returns `(matched, index past
/// the class)`, or `None` when the class is unterminated.
fn class_match(pat: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pat.get(i) == Some(&b'!');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pat.len() {
        if pat[i] == b']' && !first {
            return Some((matched != negate, i + 1));
        }
        if i + 2 < pat.len() && pat[i + 1] == b'-' && pat[i + 2] != b']' {
            if pat[i] <= c && c <= pat[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pat[i] == c {
                matched = true;
            }
            i += 1;
        }
        first = false;
    }
    None
}

/// Matchtag allocator: a counter plus free list, with the outstanding set
/// tracked so a double release is refused.
#[derive(Debug)]
pub struct MatchtagPool {
    next: u32,
    free: Vec<u32>,
    outstanding: IdSet,
}

impl Default for MatchtagPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchtagPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 1, // tag 0 is MATCHTAG_NONE
            free: Vec::new(),
            outstanding: IdSet::new(),
        }
    }

    /// Allocate a tag distinct from all currently outstanding tags.
    pub fn alloc(&mut self) -> Result<u32> {
        let tag = match self.free.pop() {
            Some(tag) => tag,
            None => {
                if self.next == u32::MAX {
                    return Err(Error::Overflow("matchtag space exhausted".to_string()));
                }
                let tag = self.next;
                self.next += 1;
                tag
            }
        };
        self.outstanding.insert(tag);
        Ok(tag)
    }

    /// Return a tag to the pool. Releasing a tag that is not outstanding is
    /// an error.
    pub fn release(&mut self, tag: u32) -> Result<()> {
        if tag == MATCHTAG_NONE {
            return Err(Error::invalid("matchtag 0 is reserved"));
        }
        if !self.outstanding.remove(tag) {
            return Err(Error::invalid(format!("matchtag {tag} is not outstanding")));
        }
        self.free.push(tag);
        Ok(())
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.count()
    }
}

/// Identifier for a registered handler, used to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(usize);

/// Handler callback. Closures capture whatever component state they serve.
pub type HandlerFn = Box<dyn FnMut(&Message)>;

struct HandlerEntry {
    types: TypeMask,
    glob: String,
    rolemask: RoleMask,
    cb: Option<HandlerFn>,
    removed: bool,
}

/// What the registry decided about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A handler matched; invoke it via [`Dispatcher::run_handler`].
    Matched(HandlerId),
    /// A handler matched but the rolemask did not intersect.
    PermissionDenied,
    /// No registered handler covers this topic and type.
    NoMatch,
}

struct PendingRpc {
    future: Future<Message>,
    streaming: bool,
}

/// The per-broker dispatch table.
pub struct Dispatcher {
    handlers: Vec<HandlerEntry>,
    pending: HashMap<u32, PendingRpc>,
    tags: MatchtagPool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            pending: HashMap::new(),
            tags: MatchtagPool::new(),
        }
    }

    /// Append a handler; consulted after everything registered before it.
    pub fn register(
        &mut self,
        types: TypeMask,
        glob: impl Into<String>,
        rolemask: RoleMask,
        cb: HandlerFn,
    ) -> HandlerId {
        let glob = glob.into();
        trace!(glob, "[dispatch] handler registered");
        self.handlers.push(HandlerEntry {
            types,
            glob,
            rolemask,
            cb: Some(cb),
            removed: false,
        });
        HandlerId(self.handlers.len() - 1)
    }

    pub fn deregister(&mut self, id: HandlerId) {
        if let Some(entry) = self.handlers.get_mut(id.0) {
            entry.removed = true;
            entry.cb = None;
        }
    }

    /// Find the first handler whose type mask and glob match, then check its
    /// rolemask against the message.
    pub fn verdict(&self, msg: &Message) -> Verdict {
        let Ok(typ) = msg.typ() else {
            return Verdict::NoMatch;
        };
        let topic = msg.topic().unwrap_or("");
        for (i, entry) in self.handlers.iter().enumerate() {
            if entry.removed || !entry.types.accepts(typ) {
                continue;
            }
            if !topic_match(&entry.glob, topic) {
                continue;
            }
            if !msg.rolemask().intersects(entry.rolemask) {
                return Verdict::PermissionDenied;
            }
            return Verdict::Matched(HandlerId(i));
        }
        Verdict::NoMatch
    }

    /// Invoke a matched handler. The callback is taken out for the duration
    /// so a handler may register or deregister others reentrantly.
    pub fn run_handler(this: &std::cell::RefCell<Self>, id: HandlerId, msg: &Message) {
        let cb = {
            let mut disp = this.borrow_mut();
            disp.handlers.get_mut(id.0).and_then(|e| e.cb.take())
        };
        let Some(mut cb) = cb else { return };
        cb(msg);
        let mut disp = this.borrow_mut();
        if let Some(entry) = disp.handlers.get_mut(id.0) {
            if !entry.removed && entry.cb.is_none() {
                entry.cb = Some(cb);
            }
        }
    }

    // === request/response correlation ===

    /// Allocate a matchtag and index the future under it.
    pub fn register_rpc(&mut self, future: Future<Message>, streaming: bool) -> Result<u32> {
        let tag = self.tags.alloc()?;
        self.pending.insert(tag, PendingRpc { future, streaming });
        Ok(tag)
    }

    /// Route a response to its pending future. Consumes the tag on
    /// completion; streaming tags survive until an error (ENODATA being the
    /// clean terminator) arrives.
    pub fn dispatch_response(&mut self, msg: &Message) -> bool {
        let Ok(tag) = msg.matchtag() else {
            return false;
        };
        if tag == MATCHTAG_NONE || !self.pending.contains_key(&tag) {
            return false;
        }
        let code = msg.errnum().unwrap_or(0);
        let terminal = {
            let rpc = &self.pending[&tag];
            code != 0 || !rpc.streaming
        };
        let rpc = if terminal {
            let rpc = self.pending.remove(&tag).expect("checked above");
            let _ = self.tags.release(tag);
            rpc
        } else {
            PendingRpc {
                future: self.pending[&tag].future.clone(),
                streaming: true,
            }
        };
        if code != 0 {
            let text = msg.payload_str().unwrap_or("").to_string();
            rpc.future.fulfill(Err(Error::from_wire(code, text)));
        } else {
            rpc.future.fulfill(Ok(msg.clone()));
        }
        true
    }

    /// Drop a pending RPC without fulfilling it (client-side cancel).
    pub fn forget_rpc(&mut self, tag: u32) {
        if self.pending.remove(&tag).is_some() {
            let _ = self.tags.release(tag);
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn outstanding_tags(&self) -> usize {
        self.tags.outstanding()
    }

    /// Fail every pending RPC, for teardown.
    pub fn fail_all(&mut self, code: i32, msg: &str) {
        let pending = std::mem::take(&mut self.pending);
        for (tag, rpc) in pending {
            let _ = self.tags.release(tag);
            rpc.future.fulfill(Err(Error::from_wire(code, msg)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::error::errnum;
    use canopy_core::reactor::Reactor;
    use std::rc::Rc;

    #[test]
    fn glob_basics() {
        assert!(topic_match("", "anything"));
        assert!(topic_match("*", "anything"));
        assert!(topic_match("scratchpad.ll", "scratchpad.ll"));
        assert!(!topic_match("scratchpad.ll", "scratchpad.sc"));
        assert!(topic_match("scratchpad.*", "scratchpad.sc-stream"));
        assert!(!topic_match("scratchpad.*", "overlay.monitor"));
        assert!(topic_match("*.disconnect", "scratchpad.disconnect"));
        assert!(topic_match("overlay.?ause", "overlay.pause"));
        assert!(!topic_match("overlay.?ause", "overlay.ppause"));
    }

    #[test]
    fn glob_classes() {
        assert!(topic_match("rank[0-3]", "rank2"));
        assert!(!topic_match("rank[0-3]", "rank5"));
        assert!(topic_match("rank[!0-3]", "rank5"));
        assert!(!topic_match("rank[!0-3]", "rank1"));
        assert!(topic_match("x[abc]z", "xbz"));
        // Unterminated class never matches.
        assert!(!topic_match("x[ab", "xa"));
    }

    #[test]
    fn matchtags_are_unique_while_outstanding() {
        let mut pool = MatchtagPool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a != MATCHTAG_NONE && b != MATCHTAG_NONE && c != MATCHTAG_NONE);
        assert_eq!(pool.outstanding(), 3);

        pool.release(b).unwrap();
        let d = pool.alloc().unwrap();
        // Freed tags may be reused, but never while outstanding.
        assert!(d == b || (d != a && d != c));
    }

    #[test]
    fn matchtag_double_release_is_refused() {
        let mut pool = MatchtagPool::new();
        let tag = pool.alloc().unwrap();
        pool.release(tag).unwrap();
        assert!(pool.release(tag).is_err());
        assert!(pool.release(MATCHTAG_NONE).is_err());
        assert!(pool.release(999).is_err());
    }

    fn request(topic: &str, rolemask: RoleMask) -> Message {
        let mut msg = Message::request(topic).unwrap();
        msg.set_rolemask(rolemask);
        msg
    }

    #[test]
    fn first_registered_match_wins() {
        let disp = std::cell::RefCell::new(Dispatcher::new());
        let hits = Rc::new(std::cell::RefCell::new(Vec::new()));

        let h = hits.clone();
        disp.borrow_mut().register(
            TypeMask::REQUEST,
            "svc.specific",
            RoleMask::ALL,
            Box::new(move |_| h.borrow_mut().push("specific")),
        );
        let h = hits.clone();
        disp.borrow_mut().register(
            TypeMask::REQUEST,
            "svc.*",
            RoleMask::ALL,
            Box::new(move |_| h.borrow_mut().push("wild")),
        );

        let msg = request("svc.specific", RoleMask::OWNER);
        let Verdict::Matched(id) = disp.borrow().verdict(&msg) else {
            panic!("expected a match")
        };
        Dispatcher::run_handler(&disp, id, &msg);

        let msg = request("svc.other", RoleMask::OWNER);
        let Verdict::Matched(id) = disp.borrow().verdict(&msg) else {
            panic!("expected a match")
        };
        Dispatcher::run_handler(&disp, id, &msg);

        assert_eq!(*hits.borrow(), vec!["specific", "wild"]);
    }

    #[test]
    fn rolemask_gates_dispatch() {
        let mut disp = Dispatcher::new();
        disp.register(
            TypeMask::REQUEST,
            "admin.*",
            RoleMask::OWNER,
            Box::new(|_| {}),
        );

        let msg = request("admin.shutdown", RoleMask::USER);
        assert_eq!(disp.verdict(&msg), Verdict::PermissionDenied);

        let msg = request("admin.shutdown", RoleMask::OWNER);
        assert!(matches!(disp.verdict(&msg), Verdict::Matched(_)));

        let msg = request("elsewhere", RoleMask::OWNER);
        assert_eq!(disp.verdict(&msg), Verdict::NoMatch);
    }

    #[test]
    fn deregistered_handler_no_longer_matches() {
        let mut disp = Dispatcher::new();
        let id = disp.register(TypeMask::REQUEST, "svc.*", RoleMask::ALL, Box::new(|_| {}));
        disp.deregister(id);
        let msg = request("svc.x", RoleMask::OWNER);
        assert_eq!(disp.verdict(&msg), Verdict::NoMatch);
    }

    #[test]
    fn response_routes_to_pending_future() {
        let reactor = Reactor::new().unwrap();
        let mut disp = Dispatcher::new();
        let fut: Future<Message> = Future::new(&reactor);
        let tag = disp.register_rpc(fut.clone(), false).unwrap();

        let mut rsp = Message::create(MessageType::Response);
        rsp.set_matchtag(tag).unwrap();
        assert!(disp.dispatch_response(&rsp));
        assert_eq!(disp.pending_count(), 0);
        assert_eq!(disp.outstanding_tags(), 0);
        assert!(fut.take().unwrap().is_ok());

        // Uncorrelated response.
        let mut stray = Message::create(MessageType::Response);
        stray.set_matchtag(4242).unwrap();
        assert!(!disp.dispatch_response(&stray));
    }

    #[test]
    fn streaming_rpc_holds_tag_until_terminal() {
        let reactor = Reactor::new().unwrap();
        let mut disp = Dispatcher::new();
        let fut: Future<Message> = Future::new(&reactor);
        let tag = disp.register_rpc(fut.clone(), true).unwrap();

        let mut rsp = Message::create(MessageType::Response);
        rsp.set_matchtag(tag).unwrap();
        assert!(disp.dispatch_response(&rsp));
        assert!(disp.dispatch_response(&rsp));
        assert_eq!(disp.pending_count(), 1, "stream stays pending");

        let mut end = Message::create(MessageType::Response);
        end.set_matchtag(tag).unwrap();
        end.set_errnum(errnum::ENODATA).unwrap();
        assert!(disp.dispatch_response(&end));
        assert_eq!(disp.pending_count(), 0);
        assert_eq!(disp.outstanding_tags(), 0);

        assert!(fut.take().unwrap().is_ok());
        assert!(fut.take().unwrap().is_ok());
        assert!(fut.take().unwrap().unwrap_err().is_stream_end());
    }
}
