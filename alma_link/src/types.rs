//! Link-layer value types.

use alma_common::NodeId;
use thiserror::Error;

/// NMT command specifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    StartNode = 0x01,
    StopNode = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// Outcome of one SDO transfer, delivered asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoResult {
    /// Download acknowledged.
    WriteOk,
    /// Upload finished; value widened to 64 bits.
    ReadOk(u64),
    /// Transfer aborted. `receive` marks the receive-side abort that the
    /// sequencer may retry once on a READ step.
    Aborted { code: u32, receive: bool },
}

impl SdoResult {
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::WriteOk | Self::ReadOk(_))
    }
}

/// Everything the link layer reports upward, in bus order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A node finished booting.
    Bootup(NodeId),
    /// Heartbeat from a node stopped arriving.
    HeartbeatLost(NodeId),
    /// Emergency object received.
    EmergencyObject { node: NodeId, error_code: u16 },
    /// Completion of the single in-flight SDO on `node`.
    SdoResult { node: NodeId, result: SdoResult },
    /// TPDO1: status word, interpolation status, mode display.
    StatusPdo {
        node: NodeId,
        status: u16,
        ip_status: u16,
        mode: u8,
    },
    /// TPDO2: absolute encoder position.
    PositionPdo { node: NodeId, position: i32 },
    /// SYNC cycle boundary.
    Sync,
}

/// Synchronous link failures (enqueue-time; transfer failures arrive as
/// [`SdoResult::Aborted`]).
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link not initialised")]
    NotInitialised,
    #[error("node {0} unknown to the link")]
    UnknownNode(NodeId),
    #[error("an SDO transfer is already in flight on node {0}")]
    SdoBusy(NodeId),
    #[error("event channel closed")]
    ChannelClosed,
    #[error("cannot open CAN board: {0}")]
    Open(String),
}
