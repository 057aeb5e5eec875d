// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process side channel pair for tests and fault injection.
//!
//! Both endpoints live in one process and exchange frames over crossbeam
//! channels: an unbounded ordered lane for messages and a bounded lane of
//! depth 1 for notifications, which makes wake-ups naturally lossy and
//! coalescing (the semantics the real transports have).
//!
//! [`LoopbackChannel::inject_crash`] lets tests simulate a peer that
//! vanished without an orderly close.

use super::{ChannelEvent, OnMessage, OnNotification, SideChannel};
use crate::error::{Error, Result};
use crate::mem::MemoryExchangeHandle;
use crossbeam::channel::{bounded, never, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum Frame {
    Message {
        bytes: Vec<u8>,
        handle: Option<MemoryExchangeHandle>,
    },
    Crash,
}

/// One endpoint of an in-process side channel pair.
pub struct LoopbackChannel {
    /// Message lane towards the peer
    tx: Mutex<Option<Sender<Frame>>>,
    /// Message lane from the peer; taken by the reactor
    rx: Mutex<Option<Receiver<Frame>>>,
    /// Notify lane towards the peer (depth 1 = lossy, coalescing)
    notify_tx: Mutex<Option<Sender<()>>>,
    /// Notify lane from the peer; taken by the reactor
    notify_rx: Mutex<Option<Receiver<()>>>,
    /// Stops the reactor on close
    ctrl_tx: Sender<()>,
    ctrl_rx: Mutex<Option<Receiver<()>>>,
    on_notification: Arc<Mutex<Option<OnNotification>>>,
    closed: Arc<AtomicBool>,
    reactor_running: Arc<AtomicBool>,
}

/// Create a connected endpoint pair.
#[must_use]
pub fn loopback_pair() -> (LoopbackChannel, LoopbackChannel) {
    let (a_to_b_tx, a_to_b_rx) = unbounded();
    let (b_to_a_tx, b_to_a_rx) = unbounded();
    let (a_notify_tx, a_notify_rx) = bounded(1);
    let (b_notify_tx, b_notify_rx) = bounded(1);

    let a = LoopbackChannel::new(a_to_b_tx, b_to_a_rx, a_notify_tx, b_notify_rx);
    let b = LoopbackChannel::new(b_to_a_tx, a_to_b_rx, b_notify_tx, a_notify_rx);
    (a, b)
}

impl LoopbackChannel {
    fn new(
        tx: Sender<Frame>,
        rx: Receiver<Frame>,
        notify_tx: Sender<()>,
        notify_rx: Receiver<()>,
    ) -> Self {
        let (ctrl_tx, ctrl_rx) = unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            notify_tx: Mutex::new(Some(notify_tx)),
            notify_rx: Mutex::new(Some(notify_rx)),
            ctrl_tx,
            ctrl_rx: Mutex::new(Some(ctrl_rx)),
            on_notification: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reactor_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the peer seeing this endpoint crash: the peer's reactor
    /// reports [`ChannelEvent::PeerCrashed`] and stops.
    pub fn inject_crash(&self) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Frame::Crash);
        }
    }
}

impl SideChannel for LoopbackChannel {
    fn send(&self, bytes: &[u8], handle: Option<MemoryExchangeHandle>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(Error::ChannelClosed)?;
        tx.send(Frame::Message {
            bytes: bytes.to_vec(),
            handle,
        })
        .map_err(|_| Error::ChannelClosed)
    }

    fn notify(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let guard = self.notify_tx.lock();
        let tx = guard.as_ref().ok_or(Error::ChannelClosed)?;
        match tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(())) => Err(Error::DroppedNotification),
            Err(TrySendError::Disconnected(())) => Err(Error::ChannelClosed),
        }
    }

    fn start_message_reception(&self, mut on_message: OnMessage) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or(Error::UnexpectedState("start_message_reception"))?;
        let notify_rx = self.notify_rx.lock().take().unwrap_or_else(never);
        let ctrl_rx = self.ctrl_rx.lock().take().unwrap_or_else(never);

        let on_notification = Arc::clone(&self.on_notification);
        let closed = Arc::clone(&self.closed);
        let running = Arc::clone(&self.reactor_running);
        running.store(true, Ordering::Release);

        std::thread::Builder::new()
            .name("shmcast-loopback".into())
            .spawn(move || {
                let mut notify_rx = notify_rx;
                loop {
                    crossbeam::select! {
                        recv(rx) -> frame => match frame {
                            Ok(Frame::Message { bytes, handle }) => {
                                on_message(ChannelEvent::Message { bytes, handle });
                            }
                            Ok(Frame::Crash) => {
                                on_message(ChannelEvent::PeerCrashed);
                                break;
                            }
                            Err(_) => {
                                if !closed.load(Ordering::Acquire) {
                                    on_message(ChannelEvent::PeerDisconnected);
                                }
                                break;
                            }
                        },
                        recv(notify_rx) -> wake => match wake {
                            Ok(()) => {
                                if let Some(cb) = on_notification.lock().as_mut() {
                                    cb();
                                }
                            }
                            // Peer dropped its notify sender; message lane
                            // reports the disconnect, stop polling this one.
                            Err(_) => notify_rx = never(),
                        },
                        recv(ctrl_rx) -> _ => break,
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
        // Dropping the senders lets the peer's reactor observe the
        // disconnect; the ctrl message stops our own reactor.
        self.tx.lock().take();
        self.notify_tx.lock().take();
        let _ = self.ctrl_tx.send(());
    }

    fn is_in_use(&self) -> bool {
        !self.closed.load(Ordering::Acquire) || self.reactor_running.load(Ordering::Acquire)
    }
}
