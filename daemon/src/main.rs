use clap::{Parser, Subcommand};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rete_core::ip::{self, IpIface};
use rete_core::Stack;
use rete_drivers::loopback;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_signal: i32) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[derive(Parser)]
#[command(name = "reted")]
#[command(about = "Userspace network stack daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the stack up on a loopback device
    Up {
        /// Interface address
        #[arg(long, default_value = "127.0.0.1")]
        addr: String,

        /// Interface netmask
        #[arg(long, default_value = "255.0.0.0")]
        netmask: String,

        /// Milliseconds between self-addressed test datagrams
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rete=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Up {
            addr,
            netmask,
            interval_ms,
        } => {
            let action = SigAction::new(
                SigHandler::Handler(handle_sigint),
                SaFlags::empty(),
                SigSet::empty(),
            );
            unsafe { signal::sigaction(Signal::SIGINT, &action)? };

            let stack = Stack::new()?;
            let dev = loopback::register(&stack)?;
            let iface = IpIface::new(&addr, &netmask)?;
            stack.ipv4().register_iface(&dev, iface)?;
            stack.ipv4().register_protocol(
                ip::PROTO_ICMP,
                Box::new(|payload, src, dst, _iface| {
                    tracing::info!("received, src={}, dst={}, len={}", src, dst, payload.len());
                }),
            )?;

            tracing::info!("starting stack on {} ({})", addr, netmask);
            stack.run()?;

            let local: ip::Addr = addr.parse()?;
            while RUNNING.load(Ordering::SeqCst) {
                if let Err(err) = stack
                    .ipv4()
                    .output(ip::PROTO_ICMP, b"0123456789", local, local)
                {
                    tracing::error!("output failed: {}", err);
                    break;
                }
                std::thread::sleep(Duration::from_millis(interval_ms));
            }

            tracing::info!("shutting down");
            stack.shutdown();
        }
    }

    Ok(())
}
