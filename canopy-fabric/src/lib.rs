//! # Canopy Fabric
//!
//! **Internal fabric crate for Canopy.**
//!
//! This crate binds the core building blocks into the broker fabric: the
//! CURVE-authenticated ROUTER/DEALER transport with its in-process ZAP
//! agent, the overlay routing engine with peer liveness, the topic
//! dispatcher with matchtag correlation, and the sync tick utility.
//! Application code should use the `canopy` crate, which assembles these
//! into a broker.

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::match_same_arms)]

pub mod cert;
pub mod dispatch;
pub mod overlay;
pub mod sync;
pub mod transport;
pub mod zap;

pub use cert::{CertStore, Certificate, PublicKey, SecretKey};
pub use dispatch::{Dispatcher, HandlerId, MatchtagPool, TypeMask, Verdict};
pub use overlay::{Overlay, OverlayConfig, PeerStatus, SendWhere};
pub use sync::SyncTimer;
pub use transport::{BindSocket, ParentSocket, TransportContext, ZmqWatcher};
pub use zap::{ZapAgent, ZAP_ENDPOINT};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use super::{
        CertStore, Certificate, Dispatcher, Overlay, OverlayConfig, SendWhere, TransportContext,
        TypeMask, ZapAgent,
    };
    pub use canopy_core::prelude::*;
}
