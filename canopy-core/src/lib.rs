//! Canopy Core
//!
//! Runtime-agnostic building blocks for the Canopy broker overlay:
//! - Typed multipart message codec (`message`)
//! - k-ary tree arithmetic (`topology`)
//! - Cooperative reactor with fd/timer/signal/child/prepare/check/idle
//!   watchers (`reactor`)
//! - Continuation futures keyed to the reactor (`future`)
//! - Identity sets, hostlists, and duration strings (`idset`, `hostlist`,
//!   `fsd`)
//! - Error types with wire errnum mapping (`error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod fsd;
pub mod future;
pub mod hostlist;
pub mod idset;
pub mod message;
pub mod reactor;
pub mod topology;

// A small prelude for downstream crates. Kept minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::error::{errnum, Error, Result};
    pub use crate::future::Future;
    pub use crate::message::{
        KeepaliveStatus, Message, MessageType, MsgFlags, RoleMask, MATCHTAG_NONE, NODEID_ANY,
    };
    pub use crate::reactor::{FdEvents, Fire, Reactor, Watcher};
    pub use crate::topology::Topology;
}
