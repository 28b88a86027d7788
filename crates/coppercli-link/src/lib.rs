//! # coppercli-link
//!
//! `Link` (§4.1): a bidirectional, line-oriented byte stream to a GRBL
//! controller over serial or TCP. The only component in the workspace
//! permitted to hold an OS handle to the controller.

pub mod backend;
pub mod link;
pub mod ports;

pub use backend::{ByteStream, MockStream, SerialStream, TcpStreamBackend};
pub use link::{Link, SerialParams, TcpParams};
pub use ports::{list_serial_ports, SerialPortInfo};
