//! Demo receiver: bind, optionally join multicast groups, print whatever
//! arrives.
//!
//! Unicast:   capsock_recv --port 14000
//! Multicast: capsock_recv --port 14000 --group 239.0.0.1 --group 239.0.0.2

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

use capsock::{CaptureSocket, Error};

#[derive(Parser, Debug)]
#[command(
    name = "capsock_recv",
    version,
    about = "Receive UDP datagrams through the packet-capture driver"
)]
struct Cli {
    /// Local address to bind; 0.0.0.0 captures on every adapter
    #[arg(long, default_value = "0.0.0.0")]
    addr: Ipv4Addr,

    /// UDP port to receive on
    #[arg(long, default_value_t = 14000)]
    port: u16,

    /// Multicast group to join (repeatable)
    #[arg(long = "group")]
    groups: Vec<Ipv4Addr>,

    /// Per-receive timeout in milliseconds; omit to wait forever
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Capture receive-buffer size in bytes, applied before binding
    #[arg(long)]
    buffer_size: Option<usize>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(message) = run(cli) {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let socket = CaptureSocket::new();
    if !socket.is_valid() {
        return Err(capsock::driver::initialization_error()
            .unwrap_or_else(|| "capture driver unavailable".to_string()));
    }

    if let Some(size) = cli.buffer_size {
        if !socket.set_receive_buffer_size(size) {
            return Err(format!("invalid receive buffer size {size}"));
        }
    }

    if !socket.bind(cli.addr, cli.port) {
        return Err(format!("unable to bind {}:{}", cli.addr, cli.port));
    }
    for group in &cli.groups {
        if !socket.join_multicast_group(*group) {
            return Err(format!("unable to join multicast group {group}"));
        }
    }

    log::info!("receiving on {}:{}", cli.addr, cli.port);

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.receive_datagram(&mut buf, timeout) {
            Ok(datagram) => println!(
                "{} bytes from {}:{}: {}",
                datagram.len,
                datagram.source_address,
                datagram.source_port,
                String::from_utf8_lossy(&buf[..datagram.len])
            ),
            Err(Error::Timeout) => println!("timeout"),
            Err(e) => return Err(e.to_string()),
        }
    }
}
