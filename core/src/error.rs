use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("device not up: {0}")]
    DeviceDown(String),

    #[error("device already up: {0}")]
    DeviceUp(String),

    #[error("frame too long for {dev}: len {len} exceeds mtu {mtu}")]
    MtuExceeded { dev: String, len: usize, mtu: u16 },

    #[error("protocol already registered: 0x{0:04x}")]
    DuplicateProtocol(u16),

    #[error("ip protocol already registered: {0}")]
    DuplicateIpProtocol(u8),

    #[error("family {family:?} already attached to {dev}")]
    DuplicateFamily {
        dev: String,
        family: crate::device::Family,
    },

    #[error("interface already attached to a device")]
    IfaceAttached,

    #[error("irq {0} conflicts with an existing registration")]
    IrqConflict(u32),

    #[error("invalid ip address: {0:?}")]
    AddrParse(String),

    #[error("no interface with address {0}")]
    NoInterface(String),

    #[error("routing unimplemented: datagrams need an explicit source address")]
    RoutingUnimplemented,

    #[error("arp resolution unavailable for {0}")]
    ArpUnresolved(String),

    #[error("interrupt worker not running")]
    WorkerGone,

    #[error("interrupt worker already running")]
    WorkerRunning,

    #[error("driver error: {0}")]
    Driver(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
