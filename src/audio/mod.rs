//! Pure audio transcoding between the carrier and model formats.
//!
//! No I/O happens here; the orchestrator feeds payloads through and routes
//! the results. See [`CallCodec`] for the per-call stateful transcoder and
//! [`g711`] for the underlying companding primitives.

pub mod codec;
pub mod g711;

pub use codec::{CallCodec, CodecError, CodecResult};
