//! Protocol dispatcher: per-EtherType input queues and the softirq drain.
//!
//! Device IRQ handlers feed frames in through [`Dispatcher::input`], which
//! copies the bytes into the matching protocol's queue and raises the
//! softirq. The interrupt worker later runs [`Dispatcher::drain`], which
//! empties every queue in protocol-registration order.

use crate::device::Device;
use crate::error::NetError;
use crate::intr::{IrqHub, IRQ_SOFTIRQ};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

/// Link-layer type codes, reused from Ethernet as the canonical numbering.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub type ProtocolHandler = Box<dyn Fn(&[u8], &Arc<Device>) + Send + Sync>;

/// One queued frame. Owns a copy of the payload; the driver's buffer may
/// be reused the moment [`Dispatcher::input`] returns.
struct QueueEntry {
    dev: Arc<Device>,
    data: Vec<u8>,
}

struct ProtocolEntry {
    ethertype: u16,
    queue: Mutex<VecDeque<QueueEntry>>,
    handler: ProtocolHandler,
}

/// EtherType-keyed registry of input queues and upper-layer handlers.
pub struct Dispatcher {
    protocols: RwLock<Vec<ProtocolEntry>>,
    intr: Arc<IrqHub>,
}

impl Dispatcher {
    pub(crate) fn new(intr: Arc<IrqHub>) -> Self {
        Self {
            protocols: RwLock::new(Vec::new()),
            intr,
        }
    }

    /// Register an upper-layer handler for an EtherType.
    ///
    /// Must happen before [`crate::Stack::run`]; the type must be unique.
    pub fn register(&self, ethertype: u16, handler: ProtocolHandler) -> Result<(), NetError> {
        let mut protocols = self.protocols.write().unwrap();
        if protocols.iter().any(|proto| proto.ethertype == ethertype) {
            tracing::error!("already registered, type=0x{:04x}", ethertype);
            return Err(NetError::DuplicateProtocol(ethertype));
        }
        protocols.push(ProtocolEntry {
            ethertype,
            queue: Mutex::new(VecDeque::new()),
            handler,
        });
        tracing::info!("registered, type=0x{:04x}", ethertype);
        Ok(())
    }

    /// Ingress entry point, called from device IRQ handlers.
    ///
    /// Copies the frame into the protocol's queue and raises the softirq.
    /// Frames for unregistered EtherTypes are silently dropped.
    pub fn input(&self, ethertype: u16, data: &[u8], dev: &Arc<Device>) -> Result<(), NetError> {
        let protocols = self.protocols.read().unwrap();
        let Some(proto) = protocols.iter().find(|proto| proto.ethertype == ethertype) else {
            tracing::debug!("unsupported, dev={}, type=0x{:04x}", dev.name(), ethertype);
            return Ok(());
        };
        let depth = {
            let mut queue = proto.queue.lock().unwrap();
            queue.push_back(QueueEntry {
                dev: Arc::clone(dev),
                data: data.to_vec(),
            });
            queue.len()
        };
        tracing::debug!(
            "queue pushed (num={}), dev={}, type=0x{:04x}, len={}",
            depth,
            dev.name(),
            ethertype,
            data.len()
        );
        self.intr.raise(IRQ_SOFTIRQ)
    }

    /// Softirq handler: drain every protocol queue to empty, in
    /// registration order, invoking each upper-layer handler.
    ///
    /// Handlers run outside the queue lock, so an in-flight IRQ can keep
    /// enqueueing during the drain; whatever it pushes is picked up either
    /// by this pass or by the softirq that push raised.
    pub(crate) fn drain(&self) {
        let protocols = self.protocols.read().unwrap();
        for proto in protocols.iter() {
            loop {
                let entry = proto.queue.lock().unwrap().pop_front();
                let Some(entry) = entry else {
                    break;
                };
                tracing::debug!(
                    "queue popped, dev={}, type=0x{:04x}, len={}",
                    entry.dev.name(),
                    proto.ethertype,
                    entry.data.len()
                );
                (proto.handler)(&entry.data, &entry.dev);
            }
        }
    }
}
