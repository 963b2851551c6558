//! Monitor-side interface to the ASN worker process.

use crate::error::SupervisorError;
use crate::hosts::HostDatabase;
use crate::protocol::{failure_sentinel, LookupReply, LookupStatus, WorkerRequest, MAX_RECORD_SIZE};

use asn_ipc::{channel as ipc_channel, Receiver as IpcReceiver, Sender as IpcSender};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::{
    collections::BTreeSet,
    env::current_exe,
    io,
    net::IpAddr,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command},
};

struct WorkerHandle {
    request_sender: IpcSender<WorkerRequest>,
    reply_receiver: IpcReceiver<LookupReply>,
    child: Option<Child>,
}

/// Queues ASN lookups with the worker process and feeds results back into
/// the host table.
///
/// `submit` and `poll` never block and are meant to be called from the
/// monitor's main loop on every iteration; [`shutdown`](Self::shutdown) is
/// the only call that waits.
pub struct AsnResolver {
    pending: BTreeSet<IpAddr>,
    worker: Option<WorkerHandle>,
}

impl AsnResolver {
    /// Spawn the `asn_worker` binary found next to the current executable.
    ///
    /// The worker drops privileges to `privdrop_user` before doing any
    /// network I/O; pass `None` only when already running unprivileged.
    /// Failure here is not recoverable - there is no degraded mode.
    pub fn spawn(privdrop_user: Option<&str>) -> Result<Self, SupervisorError> {
        let my_path = current_exe()?;
        let dir = my_path
            .parent()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let default_worker_path = dir.join("asn_worker");

        Self::with_exe_path(default_worker_path, privdrop_user)
    }

    pub fn with_exe_path(
        exec_path: impl AsRef<Path>,
        privdrop_user: Option<&str>,
    ) -> Result<Self, SupervisorError> {
        let (request_sender, request_receiver) = ipc_channel(MAX_RECORD_SIZE)?;
        let (reply_sender, reply_receiver) = ipc_channel(MAX_RECORD_SIZE)?;

        let child = unsafe {
            let request_fd = request_receiver.into_raw_fd();
            let reply_fd = reply_sender.into_raw_fd();

            let mut command = Command::new(exec_path.as_ref());
            command.args([request_fd.to_string(), reply_fd.to_string()]);
            if let Some(user) = privdrop_user {
                command.arg(user);
            }

            command
                .pre_exec(move || {
                    use libc::{fcntl, FD_CLOEXEC, F_GETFD, F_SETFD};

                    let rfd_flags = fcntl(request_fd, F_GETFD);
                    fcntl(request_fd, F_SETFD, rfd_flags & !FD_CLOEXEC);
                    let pfd_flags = fcntl(reply_fd, F_GETFD);
                    fcntl(reply_fd, F_SETFD, pfd_flags & !FD_CLOEXEC);
                    Ok(())
                })
                .spawn()?
        };

        tracing::info!("ASN worker has PID {}", child.id());

        Ok(Self {
            pending: BTreeSet::new(),
            worker: Some(WorkerHandle {
                request_sender,
                reply_receiver,
                child: Some(child),
            }),
        })
    }

    /// A resolver with no worker: every operation is a no-op. For monitors
    /// running with ASN lookups turned off.
    pub fn disabled() -> Self {
        Self {
            pending: BTreeSet::new(),
            worker: None,
        }
    }

    /// Queue an address for resolution, unless one is already in flight
    /// for it. Never blocks; on a full channel the request is dropped and
    /// may be submitted again later.
    pub fn submit(&mut self, addr: IpAddr) {
        let worker = match &self.worker {
            Some(w) => w,
            None => return,
        };

        if !self.pending.insert(addr) {
            // Already in flight; happens seldom enough that we don't care
            // about the wasted call
            tracing::debug!("{} is already queued for ASN lookup", addr);
            return;
        }

        // The pending entry must not outlive a request that never made it
        // onto the wire, or the address could never be submitted again.
        match worker.request_sender.try_send(&WorkerRequest::Resolve(addr)) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("ASN request channel full; dropping lookup for {}", addr);
                self.pending.remove(&addr);
            }
            Err(e) => {
                tracing::warn!("Ignoring error queueing ASN lookup for {}: {}", addr, e);
                self.pending.remove(&addr);
            }
        }
    }

    /// Drain any completed lookups into the host table. Never blocks;
    /// returns once no reply is immediately available.
    ///
    /// A reply that doesn't decode means the record framing has been
    /// violated and the channel can't be trusted any further; that is the
    /// one error returned rather than logged.
    pub fn poll(&mut self, hosts: &mut impl HostDatabase) -> Result<(), SupervisorError> {
        let worker = match &self.worker {
            Some(w) => w,
            None => return Ok(()),
        };

        loop {
            let reply = match worker.reply_receiver.try_recv() {
                Ok(Some(reply)) => reply,
                Ok(None) => return Ok(()),
                Err(e @ asn_ipc::Error::Serialize(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!("Ignoring read error on ASN reply channel: {}", e);
                    return Ok(());
                }
            };

            if !self.pending.remove(&reply.addr) {
                tracing::debug!("Couldn't unqueue {} - not in the pending set", reply.addr);
            }

            let asn = match reply.status {
                LookupStatus::Failed(kind) => {
                    tracing::debug!("ASN lookup for {} failed: {}", reply.addr, kind);
                    failure_sentinel(&reply.addr).to_string()
                }
                _ => reply.asn,
            };

            let record = match hosts.host_find(reply.addr) {
                Some(record) => record,
                None => {
                    tracing::debug!("Resolved {} to AS {} but it's not in the DB", reply.addr, asn);
                    continue;
                }
            };

            if record.asn.is_some() {
                // Each record is resolved at most once
                tracing::debug!(
                    "Resolved {} to AS {} but it's already in the DB",
                    reply.addr,
                    asn
                );
                continue;
            }

            record.asn = Some(asn);
        }
    }

    /// Stop the worker process and wait for it to exit. The only blocking
    /// operation here, and only meant for controlled shutdown.
    pub async fn shutdown(mut self) -> Result<(), SupervisorError> {
        let worker = match self.worker.take() {
            Some(w) => w,
            None => return Ok(()),
        };

        // The shutdown request wakes the worker out of its idle read; if
        // it's already gone the signal and wait below still clean up
        if let Err(e) = worker.request_sender.send(&WorkerRequest::Shutdown).await {
            tracing::warn!("Couldn't send shutdown request to ASN worker: {}", e);
        }
        drop(worker.request_sender);
        drop(worker.reply_receiver);

        if let Some(mut child) = worker.child {
            if let Err(e) = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT) {
                tracing::warn!("Couldn't signal ASN worker: {}", e);
            }
            tracing::debug!("Waiting for ASN worker to exit");
            let status = tokio::task::spawn_blocking(move || child.wait())
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
            tracing::debug!("ASN worker exited with {}", status);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cymru::AsnLookup;
    use crate::hosts::HostRecord;
    use crate::protocol::*;
    use crate::worker::AsnWorker;

    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_resolver() -> (
        AsnResolver,
        asn_ipc::Receiver<WorkerRequest>,
        asn_ipc::Sender<LookupReply>,
    ) {
        let (request_sender, request_receiver) = ipc_channel(MAX_RECORD_SIZE).unwrap();
        let (reply_sender, reply_receiver) = ipc_channel(MAX_RECORD_SIZE).unwrap();

        let resolver = AsnResolver {
            pending: BTreeSet::new(),
            worker: Some(WorkerHandle {
                request_sender,
                reply_receiver,
                child: None,
            }),
        };

        (resolver, request_receiver, reply_sender)
    }

    fn hosts_with(addr: IpAddr) -> BTreeMap<IpAddr, HostRecord> {
        let mut hosts = BTreeMap::new();
        hosts.insert(addr, HostRecord::default());
        hosts
    }

    #[tokio::test]
    async fn duplicate_submit_sends_one_request() {
        let (mut resolver, request_receiver, _reply_sender) = test_resolver();
        let addr: IpAddr = "8.8.8.8".parse().unwrap();

        resolver.submit(addr);
        resolver.submit(addr);

        assert_eq!(
            request_receiver.try_recv().unwrap(),
            Some(WorkerRequest::Resolve(addr))
        );
        assert!(matches!(request_receiver.try_recv(), Ok(None)));
        assert_eq!(resolver.pending.len(), 1);
    }

    #[tokio::test]
    async fn disabled_resolver_ignores_everything() {
        let mut resolver = AsnResolver::disabled();
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let mut hosts = hosts_with(addr);

        resolver.submit(addr);
        resolver.poll(&mut hosts).unwrap();
        assert!(resolver.pending.is_empty());
        assert_eq!(hosts.host_find(addr).unwrap().asn, None);

        resolver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn poll_stores_result_and_clears_pending() {
        let (mut resolver, _request_receiver, reply_sender) = test_resolver();
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let mut hosts = hosts_with(addr);

        resolver.submit(addr);
        reply_sender
            .send(&LookupReply::resolved(addr, "15169".to_string()))
            .await
            .unwrap();

        resolver.poll(&mut hosts).unwrap();

        assert_eq!(
            hosts.host_find(addr).unwrap().asn.as_deref(),
            Some("15169")
        );
        assert!(resolver.pending.is_empty());
    }

    #[tokio::test]
    async fn address_can_be_resubmitted_after_reply() {
        let (mut resolver, request_receiver, reply_sender) = test_resolver();
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let mut hosts = hosts_with(addr);

        resolver.submit(addr);
        reply_sender
            .send(&LookupReply::resolved(addr, "15169".to_string()))
            .await
            .unwrap();
        resolver.poll(&mut hosts).unwrap();

        resolver.submit(addr);
        assert_eq!(
            request_receiver.try_recv().unwrap(),
            Some(WorkerRequest::Resolve(addr))
        );
        assert_eq!(
            request_receiver.try_recv().unwrap(),
            Some(WorkerRequest::Resolve(addr))
        );
    }

    #[tokio::test]
    async fn failed_send_clears_pending_entry() {
        let (mut resolver, request_receiver, _reply_sender) = test_resolver();

        // With nobody draining the channel it fills up eventually, and the
        // first dropped request must not leave its address stuck pending
        let mut dropped = None;
        for i in 0..1_000_000u32 {
            let addr = IpAddr::V4(Ipv4Addr::from(0x0800_0000u32 + i));
            resolver.submit(addr);
            if !resolver.pending.contains(&addr) {
                dropped = Some(addr);
                break;
            }
        }
        let addr = dropped.expect("request channel never filled");

        // Once there's room again the same address is accepted
        for _ in 0..16 {
            request_receiver.try_recv().unwrap();
        }
        resolver.submit(addr);
        assert!(resolver.pending.contains(&addr));
    }

    #[tokio::test]
    async fn reply_for_unknown_host_is_discarded() {
        let (mut resolver, _request_receiver, reply_sender) = test_resolver();
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let mut hosts: BTreeMap<IpAddr, HostRecord> = BTreeMap::new();

        resolver.submit(addr);
        reply_sender
            .send(&LookupReply::resolved(addr, "15169".to_string()))
            .await
            .unwrap();

        resolver.poll(&mut hosts).unwrap();

        // The pending entry is still consumed with the reply
        assert!(resolver.pending.is_empty());
        assert!(hosts.is_empty());
    }

    #[tokio::test]
    async fn record_is_resolved_at_most_once() {
        let (mut resolver, _request_receiver, reply_sender) = test_resolver();
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let mut hosts = hosts_with(addr);
        hosts.host_find(addr).unwrap().asn = Some("15169".to_string());

        reply_sender
            .send(&LookupReply::resolved(addr, "65550".to_string()))
            .await
            .unwrap();

        resolver.poll(&mut hosts).unwrap();

        assert_eq!(
            hosts.host_find(addr).unwrap().asn.as_deref(),
            Some("15169")
        );
    }

    #[tokio::test]
    async fn failed_lookup_stores_sentinel() {
        let (mut resolver, _request_receiver, reply_sender) = test_resolver();
        let addr: IpAddr = "203.0.113.9".parse().unwrap();
        let mut hosts = hosts_with(addr);

        resolver.submit(addr);
        reply_sender
            .send(&LookupReply::failed(addr, ResolverErrorKind::ServFail))
            .await
            .unwrap();

        resolver.poll(&mut hosts).unwrap();

        assert_eq!(
            hosts.host_find(addr).unwrap().asn.as_deref(),
            Some(ASN_NONE)
        );
    }

    #[tokio::test]
    async fn poll_escalates_malformed_reply() {
        let (mut resolver, _request_receiver, reply_sender) = test_resolver();
        let mut hosts: BTreeMap<IpAddr, HostRecord> = BTreeMap::new();

        // Retype the channel end so a record of the wrong shape can be
        // written onto it
        let bad_sender = unsafe {
            asn_ipc::Sender::<Vec<u64>>::from_raw_fd(reply_sender.into_raw_fd(), MAX_RECORD_SIZE)
                .unwrap()
        };
        bad_sender.send(&vec![u64::MAX; 4]).await.unwrap();

        assert!(matches!(
            resolver.poll(&mut hosts),
            Err(SupervisorError::Channel(asn_ipc::Error::Serialize(_)))
        ));
    }

    struct StaticLookup(String);

    #[async_trait]
    impl AsnLookup for StaticLookup {
        async fn lookup_asn(&self, _addr: Ipv4Addr) -> Result<String, ResolverErrorKind> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn end_to_end_with_in_process_worker() {
        let (request_sender, request_receiver) = ipc_channel(MAX_RECORD_SIZE).unwrap();
        let (reply_sender, reply_receiver) = ipc_channel(MAX_RECORD_SIZE).unwrap();

        let worker = tokio::spawn(
            AsnWorker::new(
                request_receiver,
                reply_sender,
                StaticLookup("15169".to_string()),
            )
            .run(),
        );

        let mut resolver = AsnResolver {
            pending: BTreeSet::new(),
            worker: Some(WorkerHandle {
                request_sender,
                reply_receiver,
                child: None,
            }),
        };

        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let mut hosts = hosts_with(addr);

        resolver.submit(addr);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                resolver.poll(&mut hosts).unwrap();
                if hosts.host_find(addr).unwrap().asn.is_some() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("lookup never completed");

        assert_eq!(
            hosts.host_find(addr).unwrap().asn.as_deref(),
            Some("15169")
        );
        assert!(resolver.pending.is_empty());

        // Shutdown delivers the in-band request, which ends the worker loop
        resolver.shutdown().await.unwrap();
        worker.await.unwrap().unwrap();
    }
}
