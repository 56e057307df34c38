//! Wire-level protocol core for the telematics gateway.
//!
//! This crate knows how to turn an unreliable TCP byte stream into typed
//! tracker messages and how to produce the acknowledgement frames that keep
//! devices reporting. It covers two protocol families:
//!
//! - **Ruptela** framed-records (FM/ECO series): length-prefixed frames,
//!   CRC-16/Kermit, multi-record telemetry batches with IO elements.
//! - **Jimi** JM-LL301 (GT06-style): marker-delimited frames, table-driven
//!   CRC-ITU, login / heartbeat / GPS / time-request commands.
//!
//! The crate is pure and synchronous — no sockets, no async. Feed bytes to a
//! [`FrameReader`], hand complete frames to [`ruptela::decode`] or
//! [`jimi::decode`], and build replies with the encoder functions. Malformed
//! input never panics; framing problems come back as [`FrameError`] and
//! payloads too short for their advertised command degrade to
//! [`DecodedMessage::Unknown`].

pub mod checksum;
pub mod frame;
pub mod jimi;
pub mod message;
pub mod ruptela;

pub use frame::{Frame, FrameError, FrameReader, ProtocolFamily};
pub use message::{CellInfo, DecodedMessage, GpsFix, IoElements, Record};
