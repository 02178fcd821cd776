//! Network devices: the backend trait, registration, and the per-device
//! family-interface list.

use crate::error::NetError;
use crate::ip::IpIface;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Fixed size of the hardware address storage; [`Device::alen`] gives the
/// used prefix.
pub const ADDR_LEN: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u16 {
        const UP = 0x0001;
        const LOOPBACK = 0x0010;
        const BROADCAST = 0x0020;
        const P2P = 0x0040;
        /// The link layer requires IP-to-hardware address resolution
        /// before transmit.
        const NEED_ARP = 0x0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Dummy,
    Loopback,
    Ethernet,
}

/// Protocol families an interface can bind a device to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ip,
    Ipv6,
}

/// A per-device protocol-family binding.
#[derive(Clone)]
pub enum Iface {
    Ip(Arc<IpIface>),
}

impl Iface {
    pub fn family(&self) -> Family {
        match self {
            Iface::Ip(_) => Family::Ip,
        }
    }
}

/// Operations every device backend supplies.
///
/// `open` and `close` default to no-ops for backends without bring-up work.
pub trait DeviceOps: Send + Sync {
    fn open(&self, _dev: &Device) -> Result<(), NetError> {
        Ok(())
    }

    fn close(&self, _dev: &Device) -> Result<(), NetError> {
        Ok(())
    }

    /// Serialize one link-layer frame. `dst` is the destination hardware
    /// address ([`Device::alen`] bytes), interpreted by the backend.
    fn transmit(
        &self,
        dev: &Device,
        ethertype: u16,
        data: &[u8],
        dst: &[u8],
    ) -> Result<(), NetError>;
}

/// What a backend fills in before handing the device to
/// [`DeviceRegistry::register`].
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub mtu: u16,
    pub flags: DeviceFlags,
    pub alen: usize,
    pub addr: [u8; ADDR_LEN],
    /// Broadcast hardware address; read as the peer address on P2P links.
    pub broadcast: [u8; ADDR_LEN],
    pub ops: Arc<dyn DeviceOps>,
}

/// A registered network device. Index and name are assigned at
/// registration and immutable afterwards; only the UP flag ever changes.
pub struct Device {
    index: u32,
    name: String,
    kind: DeviceKind,
    mtu: u16,
    flags: AtomicU16,
    alen: usize,
    addr: [u8; ADDR_LEN],
    broadcast: [u8; ADDR_LEN],
    ops: Arc<dyn DeviceOps>,
    ifaces: Mutex<Vec<Iface>>,
}

impl Device {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn alen(&self) -> usize {
        self.alen
    }

    pub fn addr(&self) -> &[u8] {
        &self.addr[..self.alen]
    }

    pub fn broadcast(&self) -> &[u8] {
        &self.broadcast[..self.alen]
    }

    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.flags().contains(DeviceFlags::UP)
    }

    fn state(&self) -> &'static str {
        if self.is_up() {
            "up"
        } else {
            "down"
        }
    }

    /// Attach a family interface. At most one interface per family.
    pub fn add_iface(self: &Arc<Self>, iface: Iface) -> Result<(), NetError> {
        let mut ifaces = self.ifaces.lock().unwrap();
        if ifaces.iter().any(|entry| entry.family() == iface.family()) {
            tracing::error!(
                "family already attached, dev={}, family={:?}",
                self.name,
                iface.family()
            );
            return Err(NetError::DuplicateFamily {
                dev: self.name.clone(),
                family: iface.family(),
            });
        }
        match &iface {
            Iface::Ip(ip) => ip.bind(Arc::clone(self))?,
        }
        ifaces.push(iface);
        Ok(())
    }

    /// The attached interface of `family`, if any.
    pub fn iface(&self, family: Family) -> Option<Iface> {
        self.ifaces
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.family() == family)
            .cloned()
    }

    /// Hand one frame to the backend, gated on UP state and the MTU.
    pub fn output(&self, ethertype: u16, data: &[u8], dst: &[u8]) -> Result<(), NetError> {
        if !self.is_up() {
            tracing::error!("not opened, dev={}", self.name);
            return Err(NetError::DeviceDown(self.name.clone()));
        }
        if data.len() > self.mtu as usize {
            tracing::error!(
                "too long, dev={}, mtu={}, len={}",
                self.name,
                self.mtu,
                data.len()
            );
            return Err(NetError::MtuExceeded {
                dev: self.name.clone(),
                len: data.len(),
                mtu: self.mtu,
            });
        }
        tracing::debug!(
            "dev={}, type=0x{:04x}, len={}",
            self.name,
            ethertype,
            data.len()
        );
        match self.ops.transmit(self, ethertype, data, dst) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!("transmit failed, dev={}: {}", self.name, err);
                Err(err)
            }
        }
    }

    pub(crate) fn open(&self) -> Result<(), NetError> {
        if self.is_up() {
            tracing::error!("already opened, dev={}", self.name);
            return Err(NetError::DeviceUp(self.name.clone()));
        }
        self.ops.open(self)?;
        self.flags.fetch_or(DeviceFlags::UP.bits(), Ordering::AcqRel);
        tracing::info!("dev={}, state={}", self.name, self.state());
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<(), NetError> {
        if !self.is_up() {
            tracing::error!("not opened, dev={}", self.name);
            return Err(NetError::DeviceDown(self.name.clone()));
        }
        self.ops.close(self)?;
        self.flags
            .fetch_and(!DeviceFlags::UP.bits(), Ordering::AcqRel);
        tracing::info!("dev={}, state={}", self.name, self.state());
        Ok(())
    }
}

/// Grow-only list of registered devices.
///
/// Registration must precede [`crate::Stack::run`]; entries live for the
/// stack's lifetime.
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<Device>>>,
    next_index: AtomicU32,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            next_index: AtomicU32::new(0),
        }
    }

    /// Register a device, assigning its index and `net<index>` name.
    pub fn register(&self, spec: DeviceSpec) -> Arc<Device> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let dev = Arc::new(Device {
            index,
            name: format!("net{}", index),
            kind: spec.kind,
            mtu: spec.mtu,
            flags: AtomicU16::new(spec.flags.bits()),
            alen: spec.alen,
            addr: spec.addr,
            broadcast: spec.broadcast,
            ops: spec.ops,
            ifaces: Mutex::new(Vec::new()),
        });
        self.devices.write().unwrap().push(Arc::clone(&dev));
        tracing::info!("registered, dev={}, kind={:?}", dev.name, dev.kind);
        dev
    }

    /// Snapshot of every registered device, in registration order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().unwrap().clone()
    }
}
