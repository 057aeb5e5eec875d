// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unix domain socket side channel.
//!
//! One connected `SOCK_STREAM` socket carries both lanes:
//!
//! ```text
//! message frame:  | kind=0 | record len (u32 LE) | record | token len (u16 LE) | token |
//! notify frame:   | kind=1 |
//! ```
//!
//! A reactor thread per channel blocks on the socket and dispatches
//! callbacks. Clean EOF maps to `PeerDisconnected`; connection reset and
//! other hard errors map to `PeerCrashed`. Notify frames are written with
//! `MSG_DONTWAIT` — when the socket buffer is full the wake-up is dropped
//! rather than blocking the sender, which is exactly the lossy contract.

use super::{ChannelEvent, OnMessage, OnNotification, SideChannel};
use crate::error::{Error, Result};
use crate::mem::MemoryExchangeHandle;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const KIND_MESSAGE: u8 = 0;
const KIND_NOTIFY: u8 = 1;

/// Upper bound on one framed record; anything larger means the stream
/// framing itself is broken.
const MAX_FRAME_RECORD: u32 = 64 * 1024;

/// Side channel over a connected Unix domain stream socket.
pub struct UdsChannel {
    /// Write half; one mutex keeps message and notify frames from
    /// interleaving mid-frame
    writer: Mutex<UnixStream>,
    /// Read half; taken by the reactor
    reader: Mutex<Option<UnixStream>>,
    /// Kept for shutdown on close
    stream: UnixStream,
    on_notification: Arc<Mutex<Option<OnNotification>>>,
    closed: Arc<AtomicBool>,
    reactor_running: Arc<AtomicBool>,
}

impl UdsChannel {
    /// Wrap an already-connected stream (e.g. one side of an accepted
    /// listener connection).
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            stream,
            on_notification: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reactor_running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Connect to a listening socket path
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_stream(UnixStream::connect(path)?)
    }

    /// Connected in-process pair (tests, parent/child setups)
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }
}

impl SideChannel for UdsChannel {
    fn send(&self, bytes: &[u8], handle: Option<MemoryExchangeHandle>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        if bytes.len() as u32 > MAX_FRAME_RECORD {
            return Err(Error::Protocol(format!(
                "record of {} bytes exceeds frame limit",
                bytes.len()
            )));
        }

        let token = handle.as_ref().map(MemoryExchangeHandle::to_bytes);
        let token_len = token.as_ref().map_or(0, Vec::len);

        let mut frame = Vec::with_capacity(1 + 4 + bytes.len() + 2 + token_len);
        frame.push(KIND_MESSAGE);
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(bytes);
        frame.extend_from_slice(&(token_len as u16).to_le_bytes());
        if let Some(token) = token {
            frame.extend_from_slice(&token);
        }

        let mut writer = self.writer.lock();
        writer.write_all(&frame).map_err(map_send_error)?;
        writer.flush().map_err(map_send_error)
    }

    fn notify(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let writer = self.writer.lock();
        // SAFETY: the fd is valid while the stream lives (we hold the lock
        // on it); a 1-byte send either completes or fails whole, so it can
        // never split a message frame.
        let ret = unsafe {
            libc::send(
                writer.as_raw_fd(),
                [KIND_NOTIFY].as_ptr().cast::<libc::c_void>(),
                1,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if ret == 1 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock => Err(Error::DroppedNotification),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => Err(Error::ChannelClosed),
            _ => Err(Error::Io(err)),
        }
    }

    fn start_message_reception(&self, mut on_message: OnMessage) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or(Error::UnexpectedState("start_message_reception"))?;

        let on_notification = Arc::clone(&self.on_notification);
        let closed = Arc::clone(&self.closed);
        let running = Arc::clone(&self.reactor_running);
        running.store(true, Ordering::Release);

        std::thread::Builder::new()
            .name("shmcast-uds".into())
            .spawn(move || {
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(Inbound::Message { bytes, handle })) => {
                            on_message(ChannelEvent::Message { bytes, handle });
                        }
                        Ok(Some(Inbound::Notify)) => {
                            if let Some(cb) = on_notification.lock().as_mut() {
                                cb();
                            }
                        }
                        Ok(None) => {
                            // Clean EOF: orderly close by the peer.
                            if !closed.load(Ordering::Acquire) {
                                on_message(ChannelEvent::PeerDisconnected);
                            }
                            break;
                        }
                        Err(e) => {
                            if !closed.load(Ordering::Acquire) {
                                log::warn!("[SideChannel] read failed: {e}");
                                on_message(ChannelEvent::PeerCrashed);
                            }
                            break;
                        }
                    }
                }
                running.store(false, Ordering::Release);
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    fn register_on_notification(&self, on_notification: OnNotification) -> Result<()> {
        *self.on_notification.lock() = Some(on_notification);
        Ok(())
    }

    fn deregister_on_notification(&self) {
        *self.on_notification.lock() = None;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn is_in_use(&self) -> bool {
        !self.closed.load(Ordering::Acquire) || self.reactor_running.load(Ordering::Acquire)
    }
}

enum Inbound {
    Message {
        bytes: Vec<u8>,
        handle: Option<MemoryExchangeHandle>,
    },
    Notify,
}

/// Read one frame; `Ok(None)` is clean EOF.
fn read_frame(reader: &mut UnixStream) -> std::io::Result<Option<Inbound>> {
    let mut kind = [0u8; 1];
    match reader.read(&mut kind)? {
        0 => return Ok(None),
        _ => {}
    }

    match kind[0] {
        KIND_NOTIFY => Ok(Some(Inbound::Notify)),
        KIND_MESSAGE => {
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes);
            if len > MAX_FRAME_RECORD {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("frame record length {len} exceeds limit"),
                ));
            }
            let mut bytes = vec![0u8; len as usize];
            reader.read_exact(&mut bytes)?;

            let mut token_len_bytes = [0u8; 2];
            reader.read_exact(&mut token_len_bytes)?;
            let token_len = u16::from_le_bytes(token_len_bytes);
            let handle = if token_len == 0 {
                None
            } else {
                let mut token = vec![0u8; token_len as usize];
                reader.read_exact(&mut token)?;
                Some(MemoryExchangeHandle::from_bytes(&token).map_err(|e| {
                    std::io::Error::new(ErrorKind::InvalidData, e.to_string())
                })?)
            };
            Ok(Some(Inbound::Message { bytes, handle }))
        }
        other => Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("unknown frame kind {other}"),
        )),
    }
}

fn map_send_error(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => Error::ChannelClosed,
        _ => Error::Io(e),
    }
}
