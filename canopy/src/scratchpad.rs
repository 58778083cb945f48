//! The LL/SC scratchpad service.
//!
//! An atomic scratchpad of opaque JSON values keyed by name, with
//! optimistic concurrency: a store succeeds only when the caller's version
//! matches the stored one. The streaming variant keeps the losing request
//! open so retries ride the original matchtag instead of fresh RPCs.
//!
//! Topics, all under `scratchpad.`:
//! - `ll {key}` reads `{version, data}`; missing keys read `{0, null}`;
//!   the synthetic key `"."` reads the whole store at the global version.
//! - `sc {key, version, data}` stores iff the version matches, else fails
//!   with a deadlock error; `"."` is read-only.
//! - `sc-stream` (streaming): a match stores and terminates with "no
//!   data"; a mismatch parks the request and answers with the current
//!   `{version, data}`.
//! - `sc-retry` (no-response): retry a parked `sc-stream` by matchtag.
//! - `delete {key}` (no-response): silently remove and bump the global
//!   version.

use hashbrown::HashMap;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace, warn};

use canopy_core::error::{errnum, Result};
use canopy_core::message::{Message, MsgFlags, RoleMask};
use canopy_fabric::dispatch::TypeMask;

use crate::broker::{Broker, WeakBroker};

/// The synthetic whole-store key.
pub const ROOT_KEY: &str = ".";

#[derive(Debug, Clone)]
struct Entry {
    version: u32,
    data: Value,
}

#[derive(Deserialize)]
struct LlRequest {
    key: String,
}

#[derive(Deserialize)]
struct ScRequest {
    key: String,
    version: u32,
    data: Value,
}

#[derive(Deserialize)]
struct RetryRequest {
    matchtag: u32,
    version: u32,
    data: Value,
}

struct Store {
    entries: HashMap<String, Entry>,
    global_version: u32,
    /// Parked `sc-stream` requests awaiting retries.
    pending: Vec<Message>,
}

/// The service state; handlers share it through `Rc`.
pub struct Scratchpad {
    store: Rc<RefCell<Store>>,
}

impl Scratchpad {
    /// Register the service on a broker.
    pub fn install(broker: &Broker) -> Result<()> {
        let scratchpad = Self {
            store: Rc::new(RefCell::new(Store {
                entries: HashMap::new(),
                global_version: 0,
                pending: Vec::new(),
            })),
        };
        scratchpad.register(broker);
        Ok(())
    }

    fn register(self, broker: &Broker) {
        let wb = broker.downgrade();
        let store = self.store.clone();
        broker.register_service(
            "scratchpad",
            "ll",
            TypeMask::REQUEST,
            RoleMask::ALL,
            Box::new(move |msg| with_broker(&wb, |b| handle_ll(b, &store, msg))),
        );

        let wb = broker.downgrade();
        let store = self.store.clone();
        broker.register_handler(
            TypeMask::REQUEST,
            "scratchpad.sc",
            RoleMask::ALL,
            Box::new(move |msg| with_broker(&wb, |b| handle_sc(b, &store, msg))),
        );

        let wb = broker.downgrade();
        let store = self.store.clone();
        broker.register_handler(
            TypeMask::REQUEST,
            "scratchpad.sc-stream",
            RoleMask::ALL,
            Box::new(move |msg| with_broker(&wb, |b| handle_sc_stream(b, &store, msg))),
        );

        let wb = broker.downgrade();
        let store = self.store.clone();
        broker.register_handler(
            TypeMask::REQUEST,
            "scratchpad.sc-retry",
            RoleMask::ALL,
            Box::new(move |msg| with_broker(&wb, |b| handle_sc_retry(b, &store, msg))),
        );

        let store = self.store.clone();
        broker.register_handler(
            TypeMask::REQUEST,
            "scratchpad.delete",
            RoleMask::ALL,
            Box::new(move |msg| handle_delete(&store, msg)),
        );

        let wb = broker.downgrade();
        let store = self.store.clone();
        broker.register_handler(
            TypeMask::REQUEST,
            "scratchpad.stats",
            RoleMask::ALL,
            Box::new(move |msg| {
                with_broker(&wb, |b| {
                    let (entries, version, pending) = {
                        let store = store.borrow();
                        (
                            store.entries.len(),
                            store.global_version,
                            store.pending.len(),
                        )
                    };
                    b.respond(
                        msg,
                        &serde_json::json!({
                            "entries": entries,
                            "version": version,
                            "pending": pending,
                        }),
                    )
                })
            }),
        );

        let store = self.store.clone();
        broker.register_handler(
            TypeMask::REQUEST,
            "scratchpad.disconnect",
            RoleMask::ALL,
            Box::new(move |msg| {
                let sender = msg.first_route().unwrap_or_default().to_vec();
                let dropped = drop_pending(&store, |m| sender_of(m) == sender);
                if dropped > 0 {
                    debug!(dropped, "[scratchpad] cleared pending stores on disconnect");
                }
            }),
        );

        // Teardown: every parked request gets a terminal error first.
        let wb = broker.downgrade();
        let store = self.store;
        broker.at_shutdown(Box::new(move || {
            let pending = std::mem::take(&mut store.borrow_mut().pending);
            if pending.is_empty() {
                return;
            }
            let Some(broker) = wb.upgrade() else { return };
            for original in pending {
                let _ = broker.respond_error(&original, errnum::ENOSYS, "no such service");
            }
        }));
    }
}

fn with_broker(wb: &WeakBroker, f: impl FnOnce(&Broker) -> Result<()>) {
    let Some(broker) = wb.upgrade() else { return };
    if let Err(e) = f(&broker) {
        warn!(error = %e, "[scratchpad] handler failed");
    }
}

fn sender_of(msg: &Message) -> Vec<u8> {
    msg.first_route().unwrap_or_default().to_vec()
}

fn drop_pending(store: &Rc<RefCell<Store>>, mut pred: impl FnMut(&Message) -> bool) -> usize {
    let mut store = store.borrow_mut();
    let before = store.pending.len();
    store.pending.retain(|m| !pred(m));
    before - store.pending.len()
}

fn current_of(store: &Store, key: &str) -> (u32, Value) {
    match store.entries.get(key) {
        Some(entry) => (entry.version, entry.data.clone()),
        None => (0, Value::Null),
    }
}

/// Commit a store: per-key version is the input version plus one, and the
/// global version advances exactly once.
fn commit(store: &mut Store, key: &str, version: u32, data: Value) {
    store.entries.insert(
        key.to_string(),
        Entry {
            version: version + 1,
            data,
        },
    );
    store.global_version += 1;
    trace!(key, version = version + 1, global = store.global_version, "[scratchpad] commit");
}

fn handle_ll(broker: &Broker, store: &Rc<RefCell<Store>>, msg: &Message) -> Result<()> {
    let req: LlRequest = match msg.payload_decode() {
        Ok(req) => req,
        Err(e) => return broker.respond_error(msg, e.errnum(), "malformed ll request"),
    };
    let payload = {
        let store = store.borrow();
        if req.key == ROOT_KEY {
            let all: serde_json::Map<String, Value> = store
                .entries
                .iter()
                .map(|(k, entry)| (k.clone(), entry.data.clone()))
                .collect();
            serde_json::json!({ "version": store.global_version, "data": all })
        } else {
            let (version, data) = current_of(&store, &req.key);
            serde_json::json!({ "version": version, "data": data })
        }
    };
    broker.respond(msg, &payload)
}

fn handle_sc(broker: &Broker, store: &Rc<RefCell<Store>>, msg: &Message) -> Result<()> {
    let req: ScRequest = match msg.payload_decode() {
        Ok(req) => req,
        Err(e) => return broker.respond_error(msg, e.errnum(), "malformed sc request"),
    };
    if req.key == ROOT_KEY {
        return broker.respond_error(msg, errnum::EROFS, "the root key is read-only");
    }
    let stored = {
        let mut store = store.borrow_mut();
        let (current, _) = current_of(&store, &req.key);
        if current == req.version {
            commit(&mut store, &req.key, req.version, req.data);
            true
        } else {
            false
        }
    };
    if stored {
        broker.respond_empty(msg)
    } else {
        broker.respond_error(msg, errnum::EDEADLK, "version mismatch")
    }
}

fn handle_sc_stream(broker: &Broker, store: &Rc<RefCell<Store>>, msg: &Message) -> Result<()> {
    if !msg.flags().contains(MsgFlags::STREAMING) {
        return broker.respond_error(msg, errnum::EPROTO, "sc-stream requires streaming");
    }
    let req: ScRequest = match msg.payload_decode() {
        Ok(req) => req,
        Err(e) => return broker.respond_error(msg, e.errnum(), "malformed sc-stream request"),
    };
    if req.key == ROOT_KEY {
        return broker.respond_error(msg, errnum::EROFS, "the root key is read-only");
    }
    let outcome = {
        let mut store = store.borrow_mut();
        let (current, data) = current_of(&store, &req.key);
        if current == req.version {
            commit(&mut store, &req.key, req.version, req.data);
            None
        } else {
            store.pending.push(msg.copy(false));
            Some((current, data))
        }
    };
    match outcome {
        // Success terminates the stream.
        None => broker.respond_error(msg, errnum::ENODATA, ""),
        // Conflict: answer with the load-link view; retries follow.
        Some((version, data)) => broker.respond(
            msg,
            &serde_json::json!({ "version": version, "data": data }),
        ),
    }
}

fn handle_sc_retry(broker: &Broker, store: &Rc<RefCell<Store>>, msg: &Message) -> Result<()> {
    if !msg.flags().contains(MsgFlags::NORESPONSE) {
        warn!("[scratchpad] sc-retry without noresponse flag dropped");
        return Ok(());
    }
    let req: RetryRequest = match msg.payload_decode() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "[scratchpad] malformed sc-retry dropped");
            return Ok(());
        }
    };
    let sender = sender_of(msg);

    // Locate the parked request by matchtag and sender; an expired tag
    // means the originator already gave up, so the retry is dropped.
    let (original, outcome) = {
        let mut store = store.borrow_mut();
        let index = store.pending.iter().position(|m| {
            m.matchtag().is_ok_and(|t| t == req.matchtag) && sender_of(m) == sender
        });
        let Some(index) = index else {
            trace!(matchtag = req.matchtag, "[scratchpad] retry for expired request");
            return Ok(());
        };
        let key: String = match store.pending[index].payload_decode::<ScRequest>() {
            Ok(orig) => orig.key,
            Err(_) => {
                store.pending.remove(index);
                return Ok(());
            }
        };
        let (current, data) = current_of(&store, &key);
        if current == req.version {
            let original = store.pending.remove(index);
            commit(&mut store, &key, req.version, req.data);
            (original, None)
        } else {
            (store.pending[index].copy(false), Some((current, data)))
        }
    };
    match outcome {
        None => broker.respond_error(&original, errnum::ENODATA, ""),
        Some((version, data)) => broker.respond(
            &original,
            &serde_json::json!({ "version": version, "data": data }),
        ),
    }
}

fn handle_delete(store: &Rc<RefCell<Store>>, msg: &Message) {
    if !msg.flags().contains(MsgFlags::NORESPONSE) {
        warn!("[scratchpad] delete without noresponse flag dropped");
        return;
    }
    let req: LlRequest = match msg.payload_decode() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "[scratchpad] malformed delete dropped");
            return;
        }
    };
    if req.key == ROOT_KEY {
        warn!("[scratchpad] delete of the root key ignored");
        return;
    }
    let mut store = store.borrow_mut();
    if store.entries.remove(&req.key).is_some() {
        store.global_version += 1;
        debug!(key = req.key, global = store.global_version, "[scratchpad] deleted");
    }
}
