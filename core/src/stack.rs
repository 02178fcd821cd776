//! Stack facade: wires the subsystems together and drives their
//! lifecycle.

use crate::device::DeviceRegistry;
use crate::error::NetError;
use crate::intr::{IrqFlags, IrqHub, IRQ_SOFTIRQ};
use crate::ip::Ipv4Layer;
use crate::proto::{Dispatcher, ETHERTYPE_IPV4};
use std::sync::Arc;

/// One stack instance: interrupt hub, device registry, protocol
/// dispatcher, and IPv4 layer.
///
/// All registration happens between [`Stack::new`] and [`Stack::run`];
/// every upper-layer input handler then runs on the stack's interrupt
/// worker.
pub struct Stack {
    intr: Arc<IrqHub>,
    devices: DeviceRegistry,
    protocols: Arc<Dispatcher>,
    ipv4: Arc<Ipv4Layer>,
}

impl Stack {
    /// Build the subsystems and register the built-in handlers: the
    /// softirq drain and the IPv4 input.
    pub fn new() -> Result<Arc<Self>, NetError> {
        let intr = Arc::new(IrqHub::new());
        let protocols = Arc::new(Dispatcher::new(Arc::clone(&intr)));
        let drain = Arc::clone(&protocols);
        intr.request_irq(
            IRQ_SOFTIRQ,
            IrqFlags::empty(),
            "softirq",
            Box::new(move |_irq| {
                drain.drain();
                Ok(())
            }),
        )?;
        let ipv4 = Arc::new(Ipv4Layer::new());
        let input = Arc::clone(&ipv4);
        protocols.register(
            ETHERTYPE_IPV4,
            Box::new(move |data, dev| input.input(data, dev)),
        )?;
        tracing::info!("initialized");
        Ok(Arc::new(Self {
            intr,
            devices: DeviceRegistry::new(),
            protocols,
            ipv4,
        }))
    }

    pub fn intr(&self) -> &Arc<IrqHub> {
        &self.intr
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn protocols(&self) -> &Arc<Dispatcher> {
        &self.protocols
    }

    pub fn ipv4(&self) -> &Arc<Ipv4Layer> {
        &self.ipv4
    }

    /// Start the interrupt worker, then open every registered device.
    ///
    /// A device that fails to open is logged and skipped; only a worker
    /// start failure is fatal.
    pub fn run(&self) -> Result<(), NetError> {
        self.intr.run()?;
        tracing::debug!("open all devices...");
        for dev in self.devices.devices() {
            if let Err(err) = dev.open() {
                tracing::error!("open failed, dev={}: {}", dev.name(), err);
            }
        }
        tracing::debug!("running...");
        Ok(())
    }

    /// Close every device, then stop the interrupt worker. Idempotent.
    pub fn shutdown(&self) {
        if !self.intr.is_running() {
            return;
        }
        tracing::debug!("close all devices...");
        for dev in self.devices.devices() {
            if let Err(err) = dev.close() {
                tracing::error!("close failed, dev={}: {}", dev.name(), err);
            }
        }
        self.intr.shutdown();
        tracing::debug!("shut down");
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown();
    }
}
