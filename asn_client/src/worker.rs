//! The lookup loop run inside the worker process.

use crate::cymru::AsnLookup;
use crate::error::WorkerError;
use crate::protocol::{LookupReply, WorkerRequest};

use asn_ipc::{Receiver as IpcReceiver, Sender as IpcSender};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};

/// Addresses that provably have no origin ASN, filtered out before any DNS
/// traffic: RFC 1918 private space, RFC 5771 multicast, RFC 3927
/// link-local, and the 0/8 "this network" block.
pub fn is_reserved_range(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_multicast() || addr.is_link_local() || addr.octets()[0] == 0
}

/// The worker side of the [`AsnResolver`](crate::AsnResolver) system. This
/// should only be constructed by the worker process itself (or by tests
/// driving the loop in-process); monitors have no cause to interact with
/// it directly.
pub struct AsnWorker<R: AsnLookup> {
    request_receiver: IpcReceiver<WorkerRequest>,
    reply_sender: IpcSender<LookupReply>,
    queue: VecDeque<IpAddr>,
    resolver: R,
}

impl<R: AsnLookup> AsnWorker<R> {
    pub fn new(
        request_receiver: IpcReceiver<WorkerRequest>,
        reply_sender: IpcSender<LookupReply>,
        resolver: R,
    ) -> Self {
        Self {
            request_receiver,
            reply_sender,
            queue: VecDeque::new(),
            resolver,
        }
    }

    /// Run until the supervisor sends a shutdown request.
    ///
    /// Each iteration ingests whatever requests are waiting, then resolves
    /// exactly one queued address. Ingestion waits only when the queue is
    /// empty, so a slow DNS query delays lookups behind it but never the
    /// supervisor's sends.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        tracing::info!("ASN worker entering main loop");

        loop {
            if self.queue.is_empty() {
                match self.request_receiver.recv().await {
                    Ok(WorkerRequest::Resolve(addr)) => self.queue.push_back(addr),
                    Ok(WorkerRequest::Shutdown) => break,
                    Err(e) => return Err(e.into()),
                }
            }

            // Drain anything else already buffered before resolving
            loop {
                match self.request_receiver.try_recv() {
                    Ok(Some(WorkerRequest::Resolve(addr))) => self.queue.push_back(addr),
                    Ok(Some(WorkerRequest::Shutdown)) => {
                        // Anything still queued is abandoned; the
                        // supervisor is going away and nobody would read
                        // the replies
                        tracing::info!("Shutdown requested; ASN worker exiting");
                        return Ok(());
                    }
                    Ok(None) => break,
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some(addr) = self.queue.pop_front() {
                let reply = self.process(addr).await;

                // Replies are never dropped; wait for buffer space if we
                // must
                self.reply_sender.send(&reply).await?;
            }
        }

        tracing::info!("Shutdown requested; ASN worker exiting");
        Ok(())
    }

    async fn process(&self, addr: IpAddr) -> LookupReply {
        match addr {
            IpAddr::V4(v4) if is_reserved_range(v4) => {
                tracing::debug!("Skipping private/reserved address {}", addr);
                LookupReply::reserved(addr)
            }
            IpAddr::V4(v4) => match self.resolver.lookup_asn(v4).await {
                Ok(asn) => {
                    tracing::debug!("{} is on AS{}", addr, asn);
                    LookupReply::resolved(addr, asn)
                }
                Err(kind) => LookupReply::failed(addr, kind),
            },
            IpAddr::V6(_) => {
                tracing::debug!("No ASN lookup for IPv6 address {}", addr);
                LookupReply::unsupported(addr)
            }
        }
    }
}
