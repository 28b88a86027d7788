//! # coppercli-proxy
//!
//! `SerialProxy` (§4.8): a single-client TCP-to-serial bridge independent of
//! [`coppercli_driver::GrblDriver`], for a remote client that wants to talk
//! to the controller directly rather than through the local machine-control
//! plane. The two are mutually exclusive owners of a given serial port (§5);
//! arbitrating that is the composition root's job, not this crate's.

mod config;
mod events;
mod proxy;

pub use config::ProxyConfig;
pub use events::{ProxyEvent, RejectReason};
pub use proxy::{PortInUseProbe, SerialProxy};
