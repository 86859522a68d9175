//! SPUD: a UDP-borne substrate multiplexing independent bidirectional
//! "tubes" over a single socket pair, each identified by an 8-byte random
//! id carried on every packet.
//!
//! The crate is organized the same way the protocol is layered:
//!
//! - [`wire`] — the 13-byte header framer and the CBOR codec carried in the
//!   payload.
//! - [`id`] — tube identifiers, their generation, and their hashing.
//! - [`pktinfo`] — ancillary local-address data captured per datagram.
//! - [`tube`] — the per-tube state machine and its send-side operations.
//! - [`timer`] — the deadline-ordered timer queue integrated with the wait
//!   loop.
//! - [`socket`] / [`signal`] — the raw socket and self-pipe plumbing the
//!   manager's loop runs on.
//! - [`manager`] — the tube manager itself: socket ownership, demultiplexing,
//!   event dispatch, and the loop.
//! - [`events`] — the named-event dispatcher tubes and the manager fire into.

pub mod error;
pub mod events;
pub mod id;
pub mod manager;
pub mod pktinfo;
pub mod signal;
pub mod socket;
pub mod timer;
pub mod tube;
pub mod wire;

pub use error::{Error, Result};
pub use events::{Dispatcher, Event, EventKind};
pub use id::TubeId;
pub use manager::{ManagerConfig, ManagerHandle, TubeManager};
pub use pktinfo::Pktinfo;
pub use tube::{PathDeclaration, Role, Tube, TubeState};
pub use wire::cbor::Value;
pub use wire::{Command, Header, Packet};
