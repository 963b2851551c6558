//! Minimal stand-in for a traffic monitor: submit the addresses given on
//! the command line, poll until they all resolve, print the results.
//!
//! Run with the asn_worker binary built alongside:
//!
//!     cargo run --example monitor -- 8.8.8.8 1.1.1.1 192.168.0.1

use asn_client::*;

use std::collections::BTreeMap;
use std::env::current_exe;
use std::net::IpAddr;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addrs: Vec<IpAddr> = std::env::args()
        .skip(1)
        .map(|a| a.parse())
        .collect::<Result<_, _>>()?;

    let exe = current_exe()?
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("asn_worker");
    tracing::info!("worker exe = {:?}", exe);

    let mut resolver = AsnResolver::with_exe_path(exe, None)?;

    let mut hosts: BTreeMap<IpAddr, HostRecord> = BTreeMap::new();
    for addr in &addrs {
        hosts.insert(*addr, HostRecord::default());
        resolver.submit(*addr);
    }

    while hosts.values().any(|r| r.asn.is_none()) {
        resolver.poll(&mut hosts)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for (addr, record) in &hosts {
        println!("{} is on AS {}", addr, record.asn.as_deref().unwrap());
    }

    resolver.shutdown().await?;
    Ok(())
}
