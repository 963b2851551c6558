//! ASN lookup worker process for a traffic monitor, and interface thereto.
//!
//! This crate contains the `asn_worker` executable, which resolves origin
//! Autonomous System numbers for observed addresses via the Team Cymru DNS
//! mapping service. Keeping the lookups in a dedicated unprivileged process
//! means a slow DNS server can never stall the monitor's capture loop; the
//! two sides exchange fixed-shape records over an [`asn_ipc`] channel pair.

mod protocol;
pub use protocol::*;

mod error;
pub use error::*;

mod hosts;
pub use hosts::*;

mod cymru;
pub use cymru::*;

mod privdrop;
pub use privdrop::*;

mod worker;
pub use worker::*;

mod supervisor;
pub use supervisor::*;
