//! JSON codec for envelopes.
//!
//! Wire format: one UTF-8 JSON object per transport message, no framing.

use crate::error::{GateError, GateResult};
use crate::messages::Envelope;

/// Encode an envelope into its JSON text form.
pub fn encode(envelope: &Envelope) -> GateResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one transport message into an envelope.
pub fn decode(data: &[u8]) -> GateResult<Envelope> {
    serde_json::from_slice(data).map_err(|e| GateError::Codec(format!("bad envelope: {e}")))
}
