//! Control-plane message protocol.
//!
//! Requests arrive on subjects under the `$NEX` prefix and every reply is
//! wrapped in an [`Envelope`] whose type tag tells subscribers which payload
//! shape to expect without inspecting the body.

pub mod envelope;
pub mod subject;
pub mod types;

pub use envelope::{Envelope, EnvelopeBody, PayloadType};
pub use subject::ControlSubject;
pub use types::*;
