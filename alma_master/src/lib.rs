//! # ALMA master control core
//!
//! Supervisory brain of a fleet of identical servo drives on a CANopen
//! bus: it ingests motion tables and streamed position commands, gates
//! every operator command through a robot-wide state machine, sequences
//! compound SDO/NMT operations per node, feeds each drive's on-device
//! interpolation FIFO, and streams telemetry back to the operator pipe.
//!
//! The core is a single event loop ([`master::Master::run`]) fed by one
//! channel: link traffic, operator commands and timer expiries all arrive
//! as [`master::MasterEvent`] messages, so no callback ever races another.

pub mod events;
pub mod master;
pub mod motion;
pub mod reactor;
pub mod sequencer;
pub mod shell;
pub mod supervisor;
pub mod telemetry;

pub use events::EventBus;
pub use master::{Master, MasterEvent, Shared};
