//! The link contract.

use std::time::Duration;

use alma_common::{od::OdEntry, NodeId};

use crate::pdo::PdoImage;
use crate::types::{LinkError, NmtCommand};

/// Narrow contract over the CANopen transport.
///
/// Implementations deliver completions and unsolicited traffic as
/// [`LinkEvent`](crate::LinkEvent) values on the channel supplied at
/// construction, in bus order.
///
/// # SDO discipline
///
/// `sdo_write` and `sdo_read` are non-blocking and serialize per node: the
/// caller must not issue a second SDO to the same node before the previous
/// transfer's [`SdoResult`](crate::SdoResult) arrives. The sequencer owns
/// that invariant.
pub trait Link: Send + Sync {
    /// One-shot NMT command; `target` 0 is broadcast.
    fn nmt(&self, target: NodeId, command: NmtCommand) -> Result<(), LinkError>;

    /// Start an SDO download of `value` (`size` bytes, little-endian).
    fn sdo_write(
        &self,
        node: NodeId,
        entry: OdEntry,
        size: u8,
        value: u32,
    ) -> Result<(), LinkError>;

    /// Start an SDO upload.
    fn sdo_read(&self, node: NodeId, entry: OdEntry) -> Result<(), LinkError>;

    /// Flush every changed entry of the outgoing process image.
    fn send_pdo_event(&self) -> Result<(), LinkError>;

    /// Start the SYNC producer.
    fn start_sync(&self, period: Duration) -> Result<(), LinkError>;

    /// Stop the SYNC producer.
    fn stop_sync(&self);

    /// Outgoing process image shared with the caller.
    fn image(&self) -> &PdoImage;
}
