//! Boundary to the monitor's host table.
//!
//! The subsystem only needs two things from the table: to find the record
//! for an address the monitor has seen, and to write its `asn` field once.

use std::collections::BTreeMap;
use std::net::IpAddr;

/// The slice of a host-table entry this subsystem touches.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// Resolved ASN text, or a sentinel such as `(none)`. Written at most
    /// once, by [`AsnResolver::poll`](crate::AsnResolver::poll).
    pub asn: Option<String>,
}

/// Implemented by the monitor's host table.
pub trait HostDatabase {
    /// Look up the record for an address, if the monitor is tracking it.
    fn host_find(&mut self, addr: IpAddr) -> Option<&mut HostRecord>;
}

impl HostDatabase for BTreeMap<IpAddr, HostRecord> {
    fn host_find(&mut self, addr: IpAddr) -> Option<&mut HostRecord> {
        self.get_mut(&addr)
    }
}
