//! Wire records exchanged between the monitor process and the ASN worker.
//!
//! Replies echo the request's address back along with the lookup outcome,
//! so the two directions need no sequence numbering. Shutdown travels
//! in-band as a request record, since a closed datagram socket is
//! indistinguishable from an idle one on the receiving side.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Longest AS number we accept, in decimal digits (RFC 4893 section 7).
pub const ASN_MAX_DIGITS: usize = 10;

/// Upper bound on a single serialised record in either direction. Anything
/// larger is a protocol violation, not a message.
pub const MAX_RECORD_SIZE: u64 = 64;

/// Shown for addresses that can never have an origin ASN.
pub const ASN_NONE: &str = "(none)";
/// Shown for address families we don't resolve.
pub const ASN_UNSUPPORTED: &str = "(unsupported)";
/// Shown for multicast addresses whose lookup failed.
pub const ASN_MULTICAST: &str = "(multicast)";

/// One request record from the supervisor to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Resolve the origin ASN for this address
    Resolve(IpAddr),
    /// Finish up and exit; the supervisor is shutting down
    Shutdown,
}

/// Why a DNS lookup failed, mirroring the resolver's response-code classes.
///
/// This exists for log output only; consumers treat every variant the same
/// way, as "no ASN available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolverErrorKind {
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    /// The zone answered, but with no TXT records
    NoAnswer,
    /// A TXT record was present but not in the expected format
    BadAnswer,
    Unknown,
}

impl std::fmt::Display for ResolverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::FormErr => "FORMERR",
            Self::ServFail => "SERVFAIL",
            Self::NxDomain => "NXDOMAIN",
            Self::NotImp => "NOTIMP",
            Self::Refused => "REFUSED",
            Self::NoAnswer => "no answer records",
            Self::BadAnswer => "malformed answer",
            Self::Unknown => "unknown resolver error",
        };
        f.write_str(s)
    }
}

/// Outcome class of one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupStatus {
    /// The ASN text holds the origin AS number in decimal
    Resolved,
    /// Reserved/private address; no DNS query was made
    ReservedRange,
    /// Address family we don't resolve; no DNS query was made
    Unsupported,
    /// DNS lookup failed; the ASN text is empty
    Failed(ResolverErrorKind),
}

/// One reply record from the worker, consumed exactly once by the
/// supervisor's poll loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupReply {
    pub addr: IpAddr,
    pub status: LookupStatus,
    pub asn: String,
}

impl LookupReply {
    pub fn resolved(addr: IpAddr, asn: String) -> Self {
        Self {
            addr,
            status: LookupStatus::Resolved,
            asn,
        }
    }

    pub fn reserved(addr: IpAddr) -> Self {
        Self {
            addr,
            status: LookupStatus::ReservedRange,
            asn: ASN_NONE.to_string(),
        }
    }

    pub fn unsupported(addr: IpAddr) -> Self {
        Self {
            addr,
            status: LookupStatus::Unsupported,
            asn: ASN_UNSUPPORTED.to_string(),
        }
    }

    pub fn failed(addr: IpAddr, kind: ResolverErrorKind) -> Self {
        Self {
            addr,
            status: LookupStatus::Failed(kind),
            asn: String::new(),
        }
    }
}

/// The sentinel stored for an address whose lookup failed outright.
pub fn failure_sentinel(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V6(_) => ASN_UNSUPPORTED,
        IpAddr::V4(v4) if v4.is_multicast() => ASN_MULTICAST,
        IpAddr::V4(_) => ASN_NONE,
    }
}
