//! An inter-process channel using Unix datagram sockets
//!
//! Each message occupies exactly one datagram, so records are
//! self-delimiting: a receiver either gets a whole message or nothing.
//! Both ends expose an awaiting primitive and a non-blocking one, which
//! lets a caller block only when it has nothing else to do.
//!
//! The socket itself is a non-blocking [`std::os::unix::net::UnixDatagram`];
//! the non-blocking primitives call straight into it, so their answer
//! reflects the actual buffer state rather than the reactor's cached
//! readiness. The awaiting primitives wrap the same socket in an
//! [`AsyncFd`] and retry whenever the reactor signals readiness.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    io,
    marker::PhantomData,
    os::unix::io::{FromRawFd, IntoRawFd, RawFd},
    os::unix::net::UnixDatagram,
};
use tokio::io::unix::AsyncFd;

use parking_lot::Mutex;
use thiserror::Error;

use bincode::{DefaultOptions, Options};

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialisation error: {0}")]
    Serialize(#[from] bincode::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Serialize(e) => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn channel<T: Serialize + DeserializeOwned>(max_size: u64) -> Result<(Sender<T>, Receiver<T>)> {
    let (send_sock, recv_sock) = UnixDatagram::pair()?;
    send_sock.set_nonblocking(true)?;
    recv_sock.set_nonblocking(true)?;

    Ok((
        Sender::new(AsyncFd::new(send_sock)?, max_size),
        Receiver::new(AsyncFd::new(recv_sock)?, max_size),
    ))
}

pub struct Sender<T: Serialize> {
    socket: AsyncFd<UnixDatagram>,
    max_len: u64,
    _phantom: PhantomData<T>,
}

impl<T: Serialize> Sender<T> {
    fn new(socket: AsyncFd<UnixDatagram>, max_len: u64) -> Self {
        Self {
            socket,
            max_len,
            _phantom: PhantomData,
        }
    }

    fn encode(&self, data: &T) -> Result<Vec<u8>> {
        Ok(DefaultOptions::new()
            .with_limit(self.max_len)
            .serialize(data)?)
    }

    /// Send a message, waiting for buffer space if necessary.
    pub async fn send(&self, data: &T) -> Result<()> {
        let bytes = self.encode(data)?;

        loop {
            let mut guard = self.socket.writable().await?;

            match guard.try_io(|inner| inner.get_ref().send(&bytes)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Attempt to send without waiting. Returns `Ok(false)` if the socket
    /// buffer has no room for the message.
    pub fn try_send(&self, data: &T) -> Result<bool> {
        let bytes = self.encode(data)?;

        match self.socket.get_ref().send(&bytes) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Construct a `Sender` which takes ownership of the given raw FD.
    ///
    /// # Safety
    ///
    /// The provided FD must not be used by anything else after being passed to this function,
    /// and must have been obtained by calling `into_raw_fd` on a `Sender` of the same type.
    pub unsafe fn from_raw_fd(fd: RawFd, max_size: u64) -> std::io::Result<Self> {
        let socket = UnixDatagram::from_raw_fd(fd);
        socket.set_nonblocking(true)?;
        Ok(Self::new(AsyncFd::new(socket)?, max_size))
    }

    /// Consume a `Sender` and return the underlying file descriptor
    ///
    /// # Safety
    ///
    /// Using the returned FD for anything other than `Self::from_raw_fd` may cause unpredictable
    /// behaviour in the corresponding `Receiver`.
    pub unsafe fn into_raw_fd(self) -> RawFd {
        self.socket.into_inner().into_raw_fd()
    }
}

pub struct Receiver<T: DeserializeOwned> {
    socket: AsyncFd<UnixDatagram>,
    max_len: u64,
    recv_buffer: Mutex<Vec<u8>>,
    _phantom: PhantomData<T>,
}

impl<T: DeserializeOwned> Receiver<T> {
    fn new(socket: AsyncFd<UnixDatagram>, max_len: u64) -> Self {
        let mut recv_buf = Vec::new();
        recv_buf.resize(max_len as usize, 0u8);

        Self {
            socket,
            max_len,
            recv_buffer: Mutex::new(recv_buf),
            _phantom: PhantomData,
        }
    }

    fn decode(&self, buffer: &[u8]) -> Result<T> {
        Ok(DefaultOptions::new()
            .with_limit(self.max_len)
            .deserialize(buffer)?)
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> Result<T> {
        loop {
            let mut guard = self.socket.readable().await?;

            let mut buffer = self.recv_buffer.lock();

            match guard.try_io(|inner| inner.get_ref().recv(&mut buffer)) {
                Ok(result) => {
                    let recv_len = result?;
                    return self.decode(&buffer[..recv_len]);
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive a message if one is already queued. Returns `Ok(None)` when
    /// nothing is waiting.
    pub fn try_recv(&self) -> Result<Option<T>> {
        let mut buffer = self.recv_buffer.lock();

        match self.socket.get_ref().recv(&mut buffer) {
            Ok(recv_len) => Ok(Some(self.decode(&buffer[..recv_len])?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Construct a `Receiver` which takes ownership of the given raw FD.
    ///
    /// # Safety
    ///
    /// The provided FD must not be used by anything else after being passed to this function,
    /// and must have been obtained by calling `into_raw_fd` on a `Receiver` of the same type.
    pub unsafe fn from_raw_fd(fd: RawFd, max_size: u64) -> std::io::Result<Self> {
        let socket = UnixDatagram::from_raw_fd(fd);
        socket.set_nonblocking(true)?;
        Ok(Self::new(AsyncFd::new(socket)?, max_size))
    }

    /// Consume a `Receiver` and return the underlying file descriptor
    ///
    /// # Safety
    ///
    /// Using the returned FD for anything other than `Self::from_raw_fd` may cause unpredictable
    /// behaviour in the corresponding `Sender`.
    pub unsafe fn into_raw_fd(self) -> RawFd {
        self.socket.into_inner().into_raw_fd()
    }
}
