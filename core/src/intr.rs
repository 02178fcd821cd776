//! Interrupt subsystem: IRQ registration and the dispatch worker.
//!
//! IRQ numbers keep the POSIX signal numbering of the reference platform,
//! but delivery is an event channel: [`IrqHub::raise`] pushes the number
//! onto a multi-producer queue and a single worker thread drains it,
//! invoking every handler registered for that number. The terminate IRQ
//! closes the loop.

use crate::error::NetError;
use bitflags::bitflags;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::thread::{self, JoinHandle};

/// IRQ number. Values mirror the signal numbers of the reference platform.
pub type Irq = u32;

/// Terminate IRQ (SIGHUP). Reserved: stops the worker, never dispatched.
pub const IRQ_TERMINATE: Irq = 1;

/// Softirq IRQ (SIGUSR1). Reserved for the protocol dispatcher.
pub const IRQ_SOFTIRQ: Irq = 10;

/// First IRQ number assignable to device backends (SIGRTMIN).
pub const IRQ_BASE: Irq = 34;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// The IRQ number may be claimed by several handlers, provided
        /// every registration carries this flag.
        const SHARED = 0x0001;
    }
}

pub type IrqHandler = Box<dyn Fn(Irq) -> Result<(), NetError> + Send + Sync>;

struct IrqEntry {
    irq: Irq,
    flags: IrqFlags,
    name: String,
    handler: IrqHandler,
}

/// IRQ registry plus the worker that dispatches raised IRQs to handlers.
///
/// Registration is append-only and must finish before [`IrqHub::run`];
/// after that the entry list is only read. [`IrqHub::raise`] is safe from
/// any context, including from within a handler.
pub struct IrqHub {
    entries: RwLock<Vec<IrqEntry>>,
    tx: Sender<Irq>,
    rx: Mutex<Option<Receiver<Irq>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IrqHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            entries: RwLock::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Register a handler for `irq`.
    ///
    /// Fails if the number is reserved, or if it is already claimed and
    /// either registration lacks [`IrqFlags::SHARED`].
    pub fn request_irq(
        &self,
        irq: Irq,
        flags: IrqFlags,
        name: &str,
        handler: IrqHandler,
    ) -> Result<(), NetError> {
        if irq == IRQ_TERMINATE {
            tracing::error!("irq {} is reserved for termination", irq);
            return Err(NetError::IrqConflict(irq));
        }
        let mut entries = self.entries.write().unwrap();
        for entry in entries.iter() {
            if entry.irq == irq
                && !(entry.flags.contains(IrqFlags::SHARED) && flags.contains(IrqFlags::SHARED))
            {
                tracing::error!("irq {} conflicts with {}", irq, entry.name);
                return Err(NetError::IrqConflict(irq));
            }
        }
        entries.push(IrqEntry {
            irq,
            flags,
            name: name.to_string(),
            handler,
        });
        tracing::debug!("registered, irq={}, name={}", irq, name);
        Ok(())
    }

    /// Direct the worker to eventually invoke every handler for `irq`.
    ///
    /// Wait-free. Fails only once the worker has exited.
    pub fn raise(&self, irq: Irq) -> Result<(), NetError> {
        self.tx.send(irq).map_err(|_| NetError::WorkerGone)
    }

    /// Spawn the dispatch worker and rendezvous with it.
    pub fn run(self: &Arc<Self>) -> Result<(), NetError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or(NetError::WorkerRunning)?;
        let barrier = Arc::new(Barrier::new(2));
        let hub = Arc::clone(self);
        let ready = Arc::clone(&barrier);
        let handle = thread::Builder::new()
            .name("rete-intr".to_string())
            .spawn(move || {
                ready.wait();
                hub.dispatch_loop(rx);
            })?;
        barrier.wait();
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Raise the terminate IRQ and join the worker.
    ///
    /// Idempotent, and a no-op if [`IrqHub::run`] was never called.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().unwrap().take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.tx.send(IRQ_TERMINATE);
        if handle.join().is_err() {
            tracing::error!("interrupt worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    fn dispatch_loop(&self, rx: Receiver<Irq>) {
        tracing::debug!("interrupt worker started");
        while let Ok(irq) = rx.recv() {
            if irq == IRQ_TERMINATE {
                break;
            }
            let entries = self.entries.read().unwrap();
            for entry in entries.iter().filter(|entry| entry.irq == irq) {
                tracing::debug!("dispatch, irq={}, name={}", irq, entry.name);
                if let Err(err) = (entry.handler)(irq) {
                    tracing::error!(
                        "irq handler failed, irq={}, name={}: {}",
                        irq,
                        entry.name,
                        err
                    );
                }
            }
        }
        tracing::debug!("interrupt worker terminated");
    }
}

impl Default for IrqHub {
    fn default() -> Self {
        Self::new()
    }
}
