//! Origin-ASN lookups via the Team Cymru IP-to-ASN mapping service.
//!
//! The service is queried over DNS: reverse the octets of the IPv4 address
//! and ask for a TXT record under `origin.asn.cymru.com`. See
//! <https://www.team-cymru.com/ip-asn-mapping> for the answer format.

use crate::protocol::{ResolverErrorKind, ASN_MAX_DIGITS};

use async_trait::async_trait;
use std::net::Ipv4Addr;
use trust_dns_resolver::{
    error::{ResolveError, ResolveErrorKind},
    proto::{op::ResponseCode, rr::rdata::TXT},
    TokioAsyncResolver,
};

/// Zone serving the IP-to-ASN mapping.
const CYMRU_ORIGIN_ZONE: &str = "origin.asn.cymru.com.";

/// The one seam the worker resolves ASNs through. Only public IPv4
/// addresses reach this; reserved ranges and IPv6 are filtered out first.
#[async_trait]
pub trait AsnLookup {
    /// Resolve the origin AS number for `addr`, as decimal text.
    async fn lookup_asn(&self, addr: Ipv4Addr) -> Result<String, ResolverErrorKind>;
}

/// [`AsnLookup`] backed by real DNS TXT queries against the Cymru zone.
pub struct CymruClient;

#[async_trait]
impl AsnLookup for CymruClient {
    async fn lookup_asn(&self, addr: Ipv4Addr) -> Result<String, ResolverErrorKind> {
        let query_name = cymru_query_name(addr);

        // A fresh resolver per query keeps each lookup self-contained; the
        // query rate is far too low for resolver reuse to matter.
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            tracing::warn!("Failed to create DNS resolver: {}", e);
            ResolverErrorKind::Unknown
        })?;

        let lookup = resolver.txt_lookup(query_name.as_str()).await.map_err(|e| {
            let kind = classify_failure(&e);
            tracing::debug!("ASN lookup {} for {}", kind, query_name);
            kind
        })?;

        // Only the first answer record; we don't aggregate multi-origin
        // prefixes.
        let txt = match lookup.iter().next() {
            Some(txt) => txt,
            None => return Err(ResolverErrorKind::NoAnswer),
        };

        let presentation = txt_presentation(txt);
        let asn = match parse_asn_txt(&presentation) {
            Some(asn) => asn,
            None => {
                tracing::debug!("Unparseable TXT answer for {}: {}", query_name, presentation);
                return Err(ResolverErrorKind::BadAnswer);
            }
        };

        if asn.len() > ASN_MAX_DIGITS || !asn.bytes().all(|b| b.is_ascii_digit()) {
            tracing::debug!("Implausible ASN \"{}\" for {}", asn, query_name);
            return Err(ResolverErrorKind::BadAnswer);
        }

        Ok(asn.to_string())
    }
}

/// Reverse the octets of an IPv4 address: `1.2.3.4` becomes `4.3.2.1`.
pub fn ip4_reverse_octets(addr: Ipv4Addr) -> String {
    let [o1, o2, o3, o4] = addr.octets();
    format!("{}.{}.{}.{}", o4, o3, o2, o1)
}

/// The full query name for an address, e.g. `8.8.8.8` yields
/// `8.8.8.8.origin.asn.cymru.com.`.
pub fn cymru_query_name(addr: Ipv4Addr) -> String {
    format!("{}.{}", ip4_reverse_octets(addr), CYMRU_ORIGIN_ZONE)
}

/// Extract the ASN from a TXT record in presentation form, e.g.
/// `"3356 | 4.0.0.0/9 | US | arin | 1992-12-01"` yields `3356`: the text
/// is split at the opening quote, then at the first space after it.
pub fn parse_asn_txt(txt: &str) -> Option<&str> {
    let (_, after_quote) = txt.split_once('"')?;
    let (asn, _) = after_quote.split_once(' ')?;

    if asn.is_empty() {
        None
    } else {
        Some(asn)
    }
}

/// Render a TXT record the way `dig` would print it, which is the form
/// [`parse_asn_txt`] expects.
fn txt_presentation(txt: &TXT) -> String {
    let mut data = String::new();
    for part in txt.txt_data() {
        data.push_str(&String::from_utf8_lossy(part));
    }
    format!("\"{}\"", data)
}

/// Classify a resolver failure by its response code, for the logs. A
/// failure that isn't a well-formed DNS error response stays opaque; we
/// don't inspect its contents.
fn classify_failure(err: &ResolveError) -> ResolverErrorKind {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
            ResponseCode::FormErr => ResolverErrorKind::FormErr,
            ResponseCode::ServFail => ResolverErrorKind::ServFail,
            ResponseCode::NXDomain => ResolverErrorKind::NxDomain,
            ResponseCode::NotImp => ResolverErrorKind::NotImp,
            ResponseCode::Refused => ResolverErrorKind::Refused,
            ResponseCode::NoError => ResolverErrorKind::NoAnswer,
            _ => ResolverErrorKind::Unknown,
        },
        _ => ResolverErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_octets() {
        assert_eq!(ip4_reverse_octets(Ipv4Addr::new(1, 2, 3, 4)), "4.3.2.1");
        assert_eq!(ip4_reverse_octets(Ipv4Addr::new(4, 2, 2, 4)), "4.2.2.4");
    }

    #[test]
    fn query_name() {
        assert_eq!(
            cymru_query_name(Ipv4Addr::new(8, 8, 8, 8)),
            "8.8.8.8.origin.asn.cymru.com."
        );
        assert_eq!(
            cymru_query_name(Ipv4Addr::new(198, 51, 100, 7)),
            "7.100.51.198.origin.asn.cymru.com."
        );
    }

    #[test]
    fn parse_well_formed_answer() {
        assert_eq!(
            parse_asn_txt("\"3356 | 4.0.0.0/9 | US | arin | 1992-12-01\""),
            Some("3356")
        );
    }

    #[test]
    fn parse_answer_with_leading_owner_name() {
        // As printed by dig, the quoted rdata follows the owner name and TTL
        let line = "4.2.2.4.origin.asn.cymru.com. 10M IN TXT \"3356 | 4.0.0.0/9 | US | arin | 1992-12-01\"";
        assert_eq!(parse_asn_txt(line), Some("3356"));
    }

    #[test]
    fn parse_rejects_missing_quote() {
        assert_eq!(parse_asn_txt("3356 | 4.0.0.0/9 | US | arin"), None);
    }

    #[test]
    fn parse_rejects_no_space_after_quote() {
        assert_eq!(parse_asn_txt("\"3356"), None);
        assert_eq!(parse_asn_txt("\""), None);
        assert_eq!(parse_asn_txt("\" 3356"), None);
    }
}
