use asn_client::*;

use std::env;

use asn_ipc::{Receiver as IpcReceiver, Sender as IpcSender};

// The worker is deliberately single-tasked: one queue, one lookup in
// flight, so there's nothing for more threads to do.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = env::args();
    args.next();

    let request_fd = args.next().unwrap();
    let reply_fd = args.next().unwrap();
    let privdrop_user = args.next();

    let request_fd: i32 = request_fd.trim().parse()?;
    let reply_fd: i32 = reply_fd.trim().parse()?;

    let (request_recv, reply_send) = unsafe {
        (
            IpcReceiver::<WorkerRequest>::from_raw_fd(request_fd, MAX_RECORD_SIZE)?,
            IpcSender::<LookupReply>::from_raw_fd(reply_fd, MAX_RECORD_SIZE)?,
        )
    };

    // Drop privileges before the first DNS query ever leaves this process
    if let Some(user) = privdrop_user {
        drop_privileges(&user)?;
    }

    let worker = AsnWorker::new(request_recv, reply_send, CymruClient);
    worker.run().await?;
    Ok(())
}
