//! # Canopy
//!
//! A hierarchical broker overlay. Broker processes form a k-ary tree and
//! route typed messages (request, response, event, keepalive) over
//! CURVE-authenticated links, with per-child liveness monitoring and
//! streaming RPCs. An LL/SC scratchpad service rides the fabric and
//! exercises the streaming and cancellation machinery end to end.
//!
//! ## Quick shape
//!
//! ```rust,no_run
//! use canopy::canopy_fabric::cert::Certificate;
//! use canopy::{BrokerBuilder, Nodeid};
//! use std::time::Duration;
//!
//! fn main() -> canopy::canopy_core::error::Result<()> {
//!     let cert = Certificate::generate("rank0")?;
//!     let broker = BrokerBuilder::new(0, 1).certificate(cert).build()?;
//!     let fut = broker.rpc(
//!         "scratchpad.ll",
//!         Some(&serde_json::json!({ "key": "x" })),
//!         Nodeid::Any,
//!     )?;
//!     let rsp = fut.wait_within(Duration::from_secs(5))?;
//!     println!("{}", rsp.payload_str()?);
//!     broker.shutdown();
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod broker;
pub mod scratchpad;

pub use broker::{update_array, Broker, BrokerBuilder, Nodeid, Remote, RpcFuture, WeakBroker};
pub use scratchpad::Scratchpad;

// Re-export the layers for callers that need the lower-level APIs.
pub use canopy_core;
pub use canopy_fabric;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::broker::{Broker, BrokerBuilder, Nodeid, Remote};
    pub use canopy_core::prelude::*;
    pub use canopy_fabric::prelude::*;
}
