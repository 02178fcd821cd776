//! IPv4: addressing, interfaces, ingress validation, and egress framing.

use crate::device::{Device, DeviceFlags, Family, Iface, ADDR_LEN};
use crate::error::NetError;
use crate::proto::ETHERTYPE_IPV4;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// IP protocol numbers carried in the header's protocol field.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Header size without options (IHL 5).
pub const HDR_SIZE_MIN: usize = 20;
/// Largest datagram the 16-bit total-length field can describe.
pub const TOTAL_SIZE_MAX: usize = u16::MAX as usize;
/// Largest payload [`Ipv4Layer::output`] accepts.
pub const PAYLOAD_SIZE_MAX: usize = TOTAL_SIZE_MAX - HDR_SIZE_MIN;

const VERSION: u8 = 4;

/// An IPv4 address.
///
/// Stored as the numeric value of the four octets; byte order is applied
/// at the wire boundary, so mask arithmetic and comparisons behave like
/// the on-wire 32-bit value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Addr(u32);

impl Addr {
    /// 0.0.0.0, the unspecified source.
    pub const ANY: Addr = Addr(0);
    /// 255.255.255.255, the limited broadcast.
    pub const BROADCAST: Addr = Addr(0xffff_ffff);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Addr {
        Addr(u32::from_be_bytes([a, b, c, d]))
    }

    pub const fn octets(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn from_octets(octets: [u8; 4]) -> Addr {
        Addr(u32::from_be_bytes(octets))
    }
}

impl FromStr for Addr {
    type Err = NetError;

    /// Strict dotted-quad parse: exactly four decimal octets, nothing
    /// before, between, or after them.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for slot in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetError::AddrParse(s.to_string()))?;
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(NetError::AddrParse(s.to_string()));
            }
            let value: u16 = part
                .parse()
                .map_err(|_| NetError::AddrParse(s.to_string()))?;
            if value > 255 {
                return Err(NetError::AddrParse(s.to_string()));
            }
            *slot = value as u8;
        }
        if parts.next().is_some() {
            return Err(NetError::AddrParse(s.to_string()));
        }
        Ok(Addr::from_octets(octets))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An IP binding for one device: unicast, netmask, and the derived
/// directed broadcast.
pub struct IpIface {
    unicast: Addr,
    netmask: Addr,
    broadcast: Addr,
    dev: OnceLock<Arc<Device>>,
}

impl IpIface {
    /// Parse both addresses and derive the directed broadcast.
    pub fn new(unicast: &str, netmask: &str) -> Result<Arc<Self>, NetError> {
        let unicast = Addr::from_str(unicast)?;
        let netmask = Addr::from_str(netmask)?;
        let broadcast = Addr((unicast.0 & netmask.0) | !netmask.0);
        Ok(Arc::new(Self {
            unicast,
            netmask,
            broadcast,
            dev: OnceLock::new(),
        }))
    }

    pub fn unicast(&self) -> Addr {
        self.unicast
    }

    pub fn netmask(&self) -> Addr {
        self.netmask
    }

    pub fn broadcast(&self) -> Addr {
        self.broadcast
    }

    /// The owning device, once attached.
    pub fn dev(&self) -> Option<&Arc<Device>> {
        self.dev.get()
    }

    pub(crate) fn bind(&self, dev: Arc<Device>) -> Result<(), NetError> {
        self.dev.set(dev).map_err(|_| NetError::IfaceAttached)
    }
}

pub type IpProtocolHandler = Box<dyn Fn(&[u8], Addr, Addr, &Arc<IpIface>) + Send + Sync>;

struct IpProtocolEntry {
    protocol: u8,
    handler: IpProtocolHandler,
}

/// The IPv4 layer: interface list, upper-layer demux table, and the
/// datagram id counter.
pub struct Ipv4Layer {
    ifaces: RwLock<Vec<Arc<IpIface>>>,
    protocols: RwLock<Vec<IpProtocolEntry>>,
    id: Mutex<u16>,
}

impl Ipv4Layer {
    pub(crate) fn new() -> Self {
        Self {
            ifaces: RwLock::new(Vec::new()),
            protocols: RwLock::new(Vec::new()),
            id: Mutex::new(128),
        }
    }

    /// Attach `iface` to `dev` and add it to the source-selection list.
    ///
    /// An interface that fails device attachment never reaches the list.
    pub fn register_iface(&self, dev: &Arc<Device>, iface: Arc<IpIface>) -> Result<(), NetError> {
        dev.add_iface(Iface::Ip(Arc::clone(&iface)))?;
        self.ifaces.write().unwrap().insert(0, Arc::clone(&iface));
        tracing::info!(
            "registered: dev={}, unicast={}, netmask={}, broadcast={}",
            dev.name(),
            iface.unicast,
            iface.netmask,
            iface.broadcast
        );
        Ok(())
    }

    /// The interface whose unicast address equals `addr`.
    pub fn select(&self, addr: Addr) -> Option<Arc<IpIface>> {
        self.ifaces
            .read()
            .unwrap()
            .iter()
            .find(|iface| iface.unicast == addr)
            .cloned()
    }

    /// Register an upper-layer handler for an IP protocol number.
    pub fn register_protocol(
        &self,
        protocol: u8,
        handler: IpProtocolHandler,
    ) -> Result<(), NetError> {
        let mut protocols = self.protocols.write().unwrap();
        if protocols.iter().any(|entry| entry.protocol == protocol) {
            tracing::error!("already registered, protocol={}", protocol);
            return Err(NetError::DuplicateIpProtocol(protocol));
        }
        protocols.push(IpProtocolEntry { protocol, handler });
        tracing::info!("registered, protocol={}", protocol);
        Ok(())
    }

    /// Validate one inbound datagram and demultiplex it to the upper
    /// layer. Every rejection drops the datagram without signalling
    /// upstream.
    pub fn input(&self, data: &[u8], dev: &Arc<Device>) {
        if data.len() < HDR_SIZE_MIN {
            tracing::error!("too short, dev={}, len={}", dev.name(), data.len());
            return;
        }
        let version = data[0] >> 4;
        if version != VERSION {
            tracing::error!("invalid version, dev={}, version={}", dev.name(), version);
            return;
        }
        let hlen = ((data[0] & 0x0f) as usize) << 2;
        if data.len() < hlen {
            tracing::error!(
                "shorter than IHL, dev={}, len={}, hlen={}",
                dev.name(),
                data.len(),
                hlen
            );
            return;
        }
        let total = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < total || total < hlen {
            tracing::error!(
                "bad total length, dev={}, len={}, hlen={}, total={}",
                dev.name(),
                data.len(),
                hlen,
                total
            );
            return;
        }
        if checksum(&data[..hlen]) != 0 {
            tracing::error!("checksum error, dev={}", dev.name());
            return;
        }
        let offset = u16::from_be_bytes([data[6], data[7]]);
        if offset & 0x2000 != 0 || offset & 0x1fff != 0 {
            tracing::error!("fragments are not supported, dev={}", dev.name());
            return;
        }
        let Some(Iface::Ip(iface)) = dev.iface(Family::Ip) else {
            tracing::debug!("no ip interface, dev={}", dev.name());
            return;
        };
        let dst = Addr::from_octets([data[16], data[17], data[18], data[19]]);
        if dst != iface.unicast && dst != iface.broadcast && dst != Addr::BROADCAST {
            tracing::debug!("not for us, dev={}, dst={}", dev.name(), dst);
            return;
        }
        let src = Addr::from_octets([data[12], data[13], data[14], data[15]]);
        let protocol = data[9];
        tracing::debug!(
            "dev={}, iface={}, protocol={}, total={}",
            dev.name(),
            iface.unicast,
            protocol,
            total
        );
        let handlers = self.protocols.read().unwrap();
        let Some(entry) = handlers.iter().find(|entry| entry.protocol == protocol) else {
            tracing::debug!("no upper-layer handler, protocol={}", protocol);
            return;
        };
        (entry.handler)(&data[hlen..total], src, dst, &iface);
    }

    /// Frame `data` into an IPv4 datagram from `src` to `dst` and hand it
    /// to the owning device. Returns the number of payload bytes written.
    pub fn output(
        &self,
        protocol: u8,
        data: &[u8],
        src: Addr,
        dst: Addr,
    ) -> Result<usize, NetError> {
        if src == Addr::ANY {
            tracing::error!("routing unimplemented, dst={}", dst);
            return Err(NetError::RoutingUnimplemented);
        }
        let Some(iface) = self.select(src) else {
            tracing::error!("no interface for source, src={}", src);
            return Err(NetError::NoInterface(src.to_string()));
        };
        let Some(dev) = iface.dev() else {
            tracing::error!("interface not attached, src={}", src);
            return Err(NetError::NoInterface(src.to_string()));
        };
        if (dev.mtu() as usize) < HDR_SIZE_MIN + data.len() {
            tracing::error!(
                "too long, dev={}, mtu={}, len={}",
                dev.name(),
                dev.mtu(),
                HDR_SIZE_MIN + data.len()
            );
            return Err(NetError::MtuExceeded {
                dev: dev.name().to_string(),
                len: HDR_SIZE_MIN + data.len(),
                mtu: dev.mtu(),
            });
        }
        let id = self.generate_id();
        let datagram = build_datagram(protocol, data, iface.unicast, dst, id);
        tracing::debug!(
            "dev={}, dst={}, protocol={}, total={}",
            dev.name(),
            dst,
            protocol,
            datagram.len()
        );
        output_device(&iface, dev, &datagram, dst)?;
        Ok(data.len())
    }

    fn generate_id(&self) -> u16 {
        let mut id = self.id.lock().unwrap();
        let ret = *id;
        *id = id.wrapping_add(1);
        ret
    }
}

/// Resolve the destination hardware address and hand the datagram to the
/// device. ARP devices can only reach broadcast destinations here;
/// unicast resolution belongs to the resolver plugged in above.
fn output_device(
    iface: &IpIface,
    dev: &Arc<Device>,
    datagram: &[u8],
    dst: Addr,
) -> Result<(), NetError> {
    let mut hwaddr = [0u8; ADDR_LEN];
    if dev.flags().contains(DeviceFlags::NEED_ARP) {
        if dst == iface.broadcast || dst == Addr::BROADCAST {
            hwaddr[..dev.alen()].copy_from_slice(dev.broadcast());
        } else {
            tracing::error!("arp resolution unavailable, dst={}", dst);
            return Err(NetError::ArpUnresolved(dst.to_string()));
        }
    }
    dev.output(ETHERTYPE_IPV4, datagram, &hwaddr[..dev.alen()])
}

/// Build a header-plus-payload datagram: version 4, IHL 5, TOS 0, TTL
/// 255, no fragmentation, checksum computed with the sum field zeroed.
fn build_datagram(protocol: u8, payload: &[u8], src: Addr, dst: Addr, id: u16) -> Vec<u8> {
    let total = (HDR_SIZE_MIN + payload.len()) as u16;
    let mut hdr = [0u8; HDR_SIZE_MIN];
    hdr[0] = (VERSION << 4) | ((HDR_SIZE_MIN >> 2) as u8);
    hdr[1] = 0;
    hdr[2..4].copy_from_slice(&total.to_be_bytes());
    hdr[4..6].copy_from_slice(&id.to_be_bytes());
    hdr[6..8].copy_from_slice(&0u16.to_be_bytes());
    hdr[8] = 0xff;
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    let sum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());

    let mut datagram = Vec::with_capacity(total as usize);
    datagram.extend_from_slice(&hdr);
    datagram.extend_from_slice(payload);
    datagram
}

/// RFC 1071 one's-complement sum over `data`. A header whose stored
/// checksum is intact sums to zero.
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let &[last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceOps, DeviceRegistry, DeviceSpec};

    struct CaptureOps {
        frames: Mutex<Vec<(u16, Vec<u8>, Vec<u8>)>>,
    }

    impl CaptureOps {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeviceOps for CaptureOps {
        fn transmit(
            &self,
            _dev: &Device,
            ethertype: u16,
            data: &[u8],
            dst: &[u8],
        ) -> Result<(), NetError> {
            self.frames
                .lock()
                .unwrap()
                .push((ethertype, data.to_vec(), dst.to_vec()));
            Ok(())
        }
    }

    fn capture_device(
        registry: &DeviceRegistry,
        mtu: u16,
        flags: DeviceFlags,
        alen: usize,
        broadcast: [u8; ADDR_LEN],
    ) -> (Arc<Device>, Arc<CaptureOps>) {
        let ops = CaptureOps::new();
        let dev = registry.register(DeviceSpec {
            kind: DeviceKind::Dummy,
            mtu,
            flags,
            alen,
            addr: [0; ADDR_LEN],
            broadcast,
            ops: Arc::clone(&ops) as Arc<dyn DeviceOps>,
        });
        (dev, ops)
    }

    fn layer_with_iface(
        unicast: &str,
        netmask: &str,
    ) -> (Ipv4Layer, Arc<Device>, Arc<CaptureOps>) {
        let registry = DeviceRegistry::new();
        let (dev, ops) = capture_device(
            &registry,
            u16::MAX,
            DeviceFlags::empty(),
            0,
            [0; ADDR_LEN],
        );
        dev.open().unwrap();
        let layer = Ipv4Layer::new();
        let iface = IpIface::new(unicast, netmask).unwrap();
        layer.register_iface(&dev, iface).unwrap();
        (layer, dev, ops)
    }

    fn collector(layer: &Ipv4Layer, protocol: u8) -> Arc<Mutex<Vec<(Vec<u8>, Addr, Addr)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        layer
            .register_protocol(
                protocol,
                Box::new(move |payload, src, dst, _iface| {
                    sink.lock().unwrap().push((payload.to_vec(), src, dst));
                }),
            )
            .unwrap();
        seen
    }

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_addr_round_trips() {
        for s in ["0.0.0.0", "1.2.3.4", "255.255.255.255"] {
            assert_eq!(addr(s).to_string(), s);
        }
    }

    #[test]
    fn test_addr_rejects_malformed_strings() {
        for s in ["", "1.2.3", "1.2.3.4.5", "1.2.3.256", "1.2.3.-1", "1.2.3.a", "1..2.3"] {
            assert!(s.parse::<Addr>().is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn test_broadcast_derivation() {
        let iface = IpIface::new("192.0.2.33", "255.255.255.0").unwrap();
        assert_eq!(iface.broadcast(), addr("192.0.2.255"));
        let iface = IpIface::new("10.1.2.3", "255.0.0.0").unwrap();
        assert_eq!(iface.broadcast(), addr("10.255.255.255"));
    }

    #[test]
    fn test_iface_new_rejects_bad_addresses() {
        assert!(IpIface::new("10.0.0", "255.0.0.0").is_err());
        assert!(IpIface::new("10.0.0.1", "255.0.0.256").is_err());
    }

    #[test]
    fn test_select_by_unicast() {
        let (layer, _dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        assert!(layer.select(addr("10.0.0.2")).is_some());
        assert!(layer.select(addr("10.0.0.3")).is_none());
    }

    #[test]
    fn test_failed_attach_keeps_iface_off_selection_list() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let second = IpIface::new("10.0.0.9", "255.255.255.0").unwrap();
        assert!(layer.register_iface(&dev, second).is_err());
        assert!(layer.select(addr("10.0.0.9")).is_none());
    }

    #[test]
    fn test_emitted_header_sums_to_zero() {
        for payload in [&b""[..], b"x", b"hello world"] {
            let datagram =
                build_datagram(PROTO_UDP, payload, addr("192.0.2.1"), addr("192.0.2.2"), 7);
            assert_eq!(checksum(&datagram[..HDR_SIZE_MIN]), 0);
        }
    }

    #[test]
    fn test_input_dispatches_unicast() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let datagram =
            build_datagram(PROTO_UDP, b"payload", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        layer.input(&datagram, &dev);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"payload".to_vec());
        assert_eq!(seen[0].1, addr("10.0.0.1"));
        assert_eq!(seen[0].2, addr("10.0.0.2"));
    }

    #[test]
    fn test_input_accepts_directed_and_limited_broadcast() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        for dst in ["10.0.0.255", "255.255.255.255"] {
            let datagram = build_datagram(PROTO_UDP, b"bc", addr("10.0.0.1"), addr(dst), 1);
            layer.input(&datagram, &dev);
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_input_drops_other_destinations() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let datagram = build_datagram(PROTO_UDP, b"x", addr("10.0.0.1"), addr("10.0.1.1"), 1);
        layer.input(&datagram, &dev);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_input_ignores_trailing_bytes() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let mut datagram =
            build_datagram(PROTO_UDP, b"payload", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        datagram.extend_from_slice(b"trailer");
        layer.input(&datagram, &dev);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"payload".to_vec());
    }

    #[test]
    fn test_input_drops_truncated_datagram() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let datagram =
            build_datagram(PROTO_UDP, b"payload", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        layer.input(&datagram[..datagram.len() - 1], &dev);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_input_drops_bad_checksum() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let mut datagram = build_datagram(PROTO_UDP, b"", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        datagram[10] ^= 0x01;
        layer.input(&datagram, &dev);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_input_drops_wrong_version() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let mut datagram = build_datagram(PROTO_UDP, b"", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        datagram[0] = 0x65;
        layer.input(&datagram, &dev);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_input_drops_fragments() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let seen = collector(&layer, PROTO_UDP);
        let mut datagram = build_datagram(PROTO_UDP, b"", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        // Set the MF bit and refresh the checksum so the drop happens at
        // the fragment check, not before.
        datagram[6] = 0x20;
        datagram[10] = 0;
        datagram[11] = 0;
        let sum = checksum(&datagram[..HDR_SIZE_MIN]);
        datagram[10..12].copy_from_slice(&sum.to_be_bytes());
        layer.input(&datagram, &dev);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_input_without_iface_drops() {
        let registry = DeviceRegistry::new();
        let (dev, _ops) = capture_device(
            &registry,
            u16::MAX,
            DeviceFlags::empty(),
            0,
            [0; ADDR_LEN],
        );
        let layer = Ipv4Layer::new();
        let seen = collector(&layer, PROTO_UDP);
        let datagram = build_datagram(PROTO_UDP, b"", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        layer.input(&datagram, &dev);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_output_builds_valid_datagram() {
        let (layer, _dev, ops) = layer_with_iface("192.0.2.1", "255.255.255.0");
        let written = layer
            .output(PROTO_UDP, b"hello", addr("192.0.2.1"), addr("192.0.2.99"))
            .unwrap();
        assert_eq!(written, 5);
        let frames = ops.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let (ethertype, datagram, _dst) = &frames[0];
        assert_eq!(*ethertype, ETHERTYPE_IPV4);
        assert_eq!(datagram.len(), HDR_SIZE_MIN + 5);
        assert_eq!(datagram[0], 0x45);
        assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 25);
        assert_eq!(u16::from_be_bytes([datagram[4], datagram[5]]), 128);
        assert_eq!(datagram[8], 0xff);
        assert_eq!(datagram[9], PROTO_UDP);
        assert_eq!(&datagram[12..16], &addr("192.0.2.1").octets());
        assert_eq!(&datagram[16..20], &addr("192.0.2.99").octets());
        assert_eq!(checksum(&datagram[..HDR_SIZE_MIN]), 0);
        assert_eq!(&datagram[HDR_SIZE_MIN..], b"hello");
    }

    #[test]
    fn test_output_ids_are_monotonic_from_128() {
        let (layer, _dev, ops) = layer_with_iface("192.0.2.1", "255.255.255.0");
        for _ in 0..2 {
            layer
                .output(PROTO_UDP, b"x", addr("192.0.2.1"), addr("192.0.2.99"))
                .unwrap();
        }
        let frames = ops.frames.lock().unwrap();
        let id = |i: usize| u16::from_be_bytes([frames[i].1[4], frames[i].1[5]]);
        assert_eq!(id(0), 128);
        assert_eq!(id(1), 129);
    }

    #[test]
    fn test_output_any_source_fails() {
        let (layer, _dev, _ops) = layer_with_iface("192.0.2.1", "255.255.255.0");
        assert!(matches!(
            layer.output(PROTO_UDP, b"x", Addr::ANY, addr("192.0.2.99")),
            Err(NetError::RoutingUnimplemented)
        ));
    }

    #[test]
    fn test_output_unknown_source_fails() {
        let (layer, _dev, _ops) = layer_with_iface("192.0.2.1", "255.255.255.0");
        assert!(matches!(
            layer.output(PROTO_UDP, b"x", addr("192.0.2.2"), addr("192.0.2.99")),
            Err(NetError::NoInterface(_))
        ));
    }

    #[test]
    fn test_output_respects_device_mtu() {
        let registry = DeviceRegistry::new();
        let (dev, _ops) = capture_device(&registry, 40, DeviceFlags::empty(), 0, [0; ADDR_LEN]);
        dev.open().unwrap();
        let layer = Ipv4Layer::new();
        let iface = IpIface::new("10.0.0.1", "255.255.255.0").unwrap();
        layer.register_iface(&dev, iface).unwrap();
        layer
            .output(PROTO_UDP, &[0u8; 20], addr("10.0.0.1"), addr("10.0.0.2"))
            .unwrap();
        assert!(matches!(
            layer.output(PROTO_UDP, &[0u8; 21], addr("10.0.0.1"), addr("10.0.0.2")),
            Err(NetError::MtuExceeded { .. })
        ));
    }

    #[test]
    fn test_output_need_arp_broadcast_only() {
        let registry = DeviceRegistry::new();
        let mut broadcast = [0u8; ADDR_LEN];
        broadcast[..6].fill(0xff);
        let (dev, ops) = capture_device(
            &registry,
            1500,
            DeviceFlags::BROADCAST | DeviceFlags::NEED_ARP,
            6,
            broadcast,
        );
        dev.open().unwrap();
        let layer = Ipv4Layer::new();
        let iface = IpIface::new("10.0.0.1", "255.255.255.0").unwrap();
        layer.register_iface(&dev, iface).unwrap();

        layer
            .output(PROTO_UDP, b"x", addr("10.0.0.1"), addr("10.0.0.255"))
            .unwrap();
        assert_eq!(ops.frames.lock().unwrap()[0].2, vec![0xff; 6]);

        assert!(matches!(
            layer.output(PROTO_UDP, b"x", addr("10.0.0.1"), addr("10.0.0.2")),
            Err(NetError::ArpUnresolved(_))
        ));
    }

    #[test]
    fn test_duplicate_ip_protocol_rejected() {
        let layer = Ipv4Layer::new();
        let _seen = collector(&layer, PROTO_UDP);
        assert!(matches!(
            layer.register_protocol(PROTO_UDP, Box::new(|_, _, _, _| {})),
            Err(NetError::DuplicateIpProtocol(PROTO_UDP))
        ));
    }

    #[test]
    fn test_input_without_upper_handler_drops() {
        let (layer, dev, _ops) = layer_with_iface("10.0.0.2", "255.255.255.0");
        let datagram = build_datagram(PROTO_TCP, b"x", addr("10.0.0.1"), addr("10.0.0.2"), 1);
        // No handler registered for TCP; accepted but dropped.
        layer.input(&datagram, &dev);
    }
}
