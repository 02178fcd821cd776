//! Loopback device: transmitted frames come straight back in through the
//! receive path.
//!
//! `transmit` parks the frame in a FIFO and raises the loopback IRQ; the
//! IRQ handler, running on the interrupt worker, drains the FIFO into the
//! protocol dispatcher.

use rete_core::device::{Device, DeviceFlags, DeviceKind, DeviceOps, DeviceSpec, ADDR_LEN};
use rete_core::intr::{Irq, IrqFlags, IrqHub, IRQ_BASE};
use rete_core::{NetError, Stack};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// IRQ number shared by every loopback device.
pub const IRQ: Irq = IRQ_BASE + 1;

struct LoopbackOps {
    intr: Arc<IrqHub>,
    queue: Arc<Mutex<VecDeque<(u16, Vec<u8>)>>>,
}

impl DeviceOps for LoopbackOps {
    fn transmit(
        &self,
        dev: &Device,
        ethertype: u16,
        data: &[u8],
        _dst: &[u8],
    ) -> Result<(), NetError> {
        let depth = {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back((ethertype, data.to_vec()));
            queue.len()
        };
        tracing::debug!(
            "queue pushed (num={}), dev={}, type=0x{:04x}, len={}",
            depth,
            dev.name(),
            ethertype,
            data.len()
        );
        self.intr.raise(IRQ)
    }
}

/// Register a loopback device on `stack`.
pub fn register(stack: &Stack) -> Result<Arc<Device>, NetError> {
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let dev = stack.devices().register(DeviceSpec {
        kind: DeviceKind::Loopback,
        mtu: u16::MAX,
        flags: DeviceFlags::LOOPBACK,
        alen: 0,
        addr: [0; ADDR_LEN],
        broadcast: [0; ADDR_LEN],
        ops: Arc::new(LoopbackOps {
            intr: Arc::clone(stack.intr()),
            queue: Arc::clone(&queue),
        }),
    });
    let name = dev.name().to_string();
    let protocols = Arc::clone(stack.protocols());
    let rx_dev = Arc::clone(&dev);
    stack.intr().request_irq(
        IRQ,
        IrqFlags::SHARED,
        &name,
        Box::new(move |_irq| {
            loop {
                let frame = queue.lock().unwrap().pop_front();
                let Some((ethertype, data)) = frame else {
                    break;
                };
                tracing::debug!(
                    "queue popped, dev={}, type=0x{:04x}, len={}",
                    rx_dev.name(),
                    ethertype,
                    data.len()
                );
                protocols.input(ethertype, &data, &rx_dev)?;
            }
            Ok(())
        }),
    )?;
    tracing::info!("initialized, dev={}", dev.name());
    Ok(dev)
}
