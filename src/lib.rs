//! Receive-only UDP datagram sockets on top of a packet-capture driver.
//!
//! The kernel's ordinary datagram sockets drop packets under sustained
//! load and cannot share a port the way some receivers need. This crate
//! sidesteps the host protocol stack: it binds capture handles to the
//! network adapters implied by the requested address, installs a kernel
//! packet filter narrowed to the bound UDP port, reassembles fragmented
//! IPv4 datagrams in user space, and exposes the result through a
//! socket-like blocking receive with timeout and thread-safe close.
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! let socket = capsock::CaptureSocket::new();
//! assert!(socket.is_valid());
//! assert!(socket.bind(Ipv4Addr::UNSPECIFIED, 14000));
//!
//! let mut buf = vec![0u8; 65536];
//! match socket.receive_datagram(&mut buf, Some(Duration::from_secs(1))) {
//!     Ok(datagram) => println!(
//!         "{} bytes from {}:{}",
//!         datagram.len, datagram.source_address, datagram.source_port
//!     ),
//!     Err(capsock::Error::Timeout) => println!("nothing yet"),
//!     Err(e) => eprintln!("receive failed: {e}"),
//! }
//! socket.close();
//! ```
//!
//! Receiving is capture-only: this crate never sends datagrams (the one
//! exception is the zero-byte loopback-multicast kickstart, which never
//! leaves the host).

pub mod driver;
pub mod error;
pub mod socket;

mod device;
mod filter;
mod kickstart;
mod packet;
mod reassembly;
mod wait;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;
pub use socket::{CaptureSocket, Datagram};
