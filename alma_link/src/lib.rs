//! # ALMA link layer
//!
//! Narrow contract over the CANopen transport (SDO, PDO, NMT, SYNC) plus
//! the in-process drive simulator. The control core talks only through the
//! [`Link`] trait; completions and unsolicited traffic arrive on a channel
//! as [`LinkEvent`] values, so callers never block on the bus.

pub mod driver;
pub mod pdo;
pub mod sim;
pub mod types;

pub use driver::Link;
pub use pdo::{PdoFlush, PdoImage};
pub use sim::SimLink;
pub use types::{LinkError, LinkEvent, NmtCommand, SdoResult};
