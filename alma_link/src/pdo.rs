//! Outgoing PDO process image.
//!
//! The master writes mapped values here and calls
//! [`Link::send_pdo_event`](crate::Link::send_pdo_event) to flush whatever
//! changed. Entries carry dirty marks so an unchanged value is never put on
//! the bus, mirroring the event-driven transmission type the RPDOs are
//! configured with.

use std::collections::BTreeMap;

use alma_common::NodeId;
use parking_lot::Mutex;

/// Per-node outgoing values (RPDO1..RPDO3 of that node).
#[derive(Debug, Clone, Copy, Default)]
struct NodeImage {
    /// 0x60C2:1, interpolation time units.
    ip_time_units: u8,
    /// 0x60C2:2, interpolation time index (power-of-ten exponent).
    ip_time_index: i8,
    /// 0x60C1:1, interpolation data record.
    ip_position: i32,
    ip_dirty: bool,
    /// 0x6081, profile velocity.
    profile_velocity: u32,
    /// 0x607A, target position.
    target_position: i32,
    target_dirty: bool,
}

#[derive(Debug, Default)]
struct ImageInner {
    nodes: BTreeMap<NodeId, NodeImage>,
    /// 0x6040 via the broadcast RPDO4.
    control_word: u16,
    control_dirty: bool,
}

/// One flushed entry, as the transport sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoFlush {
    /// RPDO1 + RPDO3: one interpolation segment for `node`.
    IpSegment {
        node: NodeId,
        time_units: u8,
        time_index: i8,
        position: i32,
    },
    /// RPDO2: rolling profile-velocity / target-position update.
    Target {
        node: NodeId,
        velocity: u32,
        position: i32,
    },
    /// RPDO4: control word broadcast to every node.
    ControlWord(u16),
}

/// Thread-safe outgoing process image.
#[derive(Debug, Default)]
pub struct PdoImage {
    inner: Mutex<ImageInner>,
}

impl PdoImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one interpolation segment for `node`. The segment is encoded
    /// as `units * 10^index` seconds; a zero-units segment is the
    /// trajectory terminator.
    pub fn set_ip_segment(&self, node: NodeId, time_units: u8, time_index: i8, position: i32) {
        let mut inner = self.inner.lock();
        let entry = inner.nodes.entry(node).or_default();
        entry.ip_time_units = time_units;
        entry.ip_time_index = time_index;
        entry.ip_position = position;
        entry.ip_dirty = true;
    }

    /// Queue a rolling target update for `node`.
    pub fn set_target(&self, node: NodeId, velocity: u32, position: i32) {
        let mut inner = self.inner.lock();
        let entry = inner.nodes.entry(node).or_default();
        entry.profile_velocity = velocity;
        entry.target_position = position;
        entry.target_dirty = true;
    }

    /// Queue the broadcast control word.
    pub fn set_control_word(&self, value: u16) {
        let mut inner = self.inner.lock();
        inner.control_word = value;
        inner.control_dirty = true;
    }

    /// Drain every dirty entry in deterministic (node, kind) order.
    pub fn take_dirty(&self) -> Vec<PdoFlush> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for (&node, entry) in inner.nodes.iter_mut() {
            if entry.ip_dirty {
                entry.ip_dirty = false;
                out.push(PdoFlush::IpSegment {
                    node,
                    time_units: entry.ip_time_units,
                    time_index: entry.ip_time_index,
                    position: entry.ip_position,
                });
            }
            if entry.target_dirty {
                entry.target_dirty = false;
                out.push(PdoFlush::Target {
                    node,
                    velocity: entry.profile_velocity,
                    position: entry.target_position,
                });
            }
        }
        if inner.control_dirty {
            inner.control_dirty = false;
            out.push(PdoFlush::ControlWord(inner.control_word));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_entries_are_not_flushed() {
        let image = PdoImage::new();
        assert!(image.take_dirty().is_empty());

        image.set_ip_segment(119, 100, -3, 1_000);
        let flushed = image.take_dirty();
        assert_eq!(
            flushed,
            vec![PdoFlush::IpSegment {
                node: 119,
                time_units: 100,
                time_index: -3,
                position: 1_000
            }]
        );
        // Second flush is empty until something changes again.
        assert!(image.take_dirty().is_empty());
    }

    #[test]
    fn control_word_flushes_last() {
        let image = PdoImage::new();
        image.set_control_word(0x1F);
        image.set_target(119, 300_000, 0);
        let flushed = image.take_dirty();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[1], PdoFlush::ControlWord(0x1F));
    }
}
