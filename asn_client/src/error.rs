use thiserror::Error;

/// An error starting or stopping the ASN worker process.
///
/// The subsystem has no degraded mode: a monitor that enables ASN lookups
/// should treat a spawn failure as fatal.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Channel error: {0}")]
    Channel(#[from] asn_ipc::Error),
}

/// A fatal error in the worker process.
///
/// Anything recoverable (a failed DNS lookup) is reported in-band as a
/// [`LookupReply`](crate::LookupReply); this type covers only conditions
/// after which the channel can't be trusted.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IPC protocol violation: {0}")]
    Protocol(#[from] asn_ipc::Error),
}
