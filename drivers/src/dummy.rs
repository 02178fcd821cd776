//! Dummy device: discards every transmitted frame, then reports an
//! interrupt the way real hardware would.

use rete_core::device::{Device, DeviceFlags, DeviceKind, DeviceOps, DeviceSpec, ADDR_LEN};
use rete_core::intr::{Irq, IrqFlags, IrqHub, IRQ_BASE};
use rete_core::{NetError, Stack};
use std::sync::Arc;

/// IRQ number shared by every dummy device.
pub const IRQ: Irq = IRQ_BASE;

struct DummyOps {
    intr: Arc<IrqHub>,
}

impl DeviceOps for DummyOps {
    fn transmit(
        &self,
        dev: &Device,
        ethertype: u16,
        data: &[u8],
        _dst: &[u8],
    ) -> Result<(), NetError> {
        tracing::debug!(
            "dev={}, type=0x{:04x}, len={}",
            dev.name(),
            ethertype,
            data.len()
        );
        self.intr.raise(IRQ)
    }
}

/// Register a dummy device on `stack`.
pub fn register(stack: &Stack) -> Result<Arc<Device>, NetError> {
    let dev = stack.devices().register(DeviceSpec {
        kind: DeviceKind::Dummy,
        mtu: u16::MAX,
        flags: DeviceFlags::empty(),
        alen: 0,
        addr: [0; ADDR_LEN],
        broadcast: [0; ADDR_LEN],
        ops: Arc::new(DummyOps {
            intr: Arc::clone(stack.intr()),
        }),
    });
    let name = dev.name().to_string();
    let handler_name = name.clone();
    stack.intr().request_irq(
        IRQ,
        IrqFlags::SHARED,
        &name,
        Box::new(move |irq| {
            tracing::debug!("irq={}, dev={}", irq, handler_name);
            Ok(())
        }),
    )?;
    tracing::info!("initialized, dev={}", dev.name());
    Ok(dev)
}
