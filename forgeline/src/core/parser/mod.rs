//! Resilient recovery of a [`ResponseEnvelope`] from raw generator text.
//!
//! Tiers, each tried only when the previous one fails:
//! 1. payload extraction from reasoning tags, fences, or bare braces ([`extract`]);
//! 2. direct JSON parse of the payload;
//! 3. field isolation: `content` values are lifted out with a quote-aware
//!    scanner, the remaining document is repaired and parsed, and the values
//!    are put back ([`isolate`]);
//! 4. pattern fallback for documents with a known artifact set ([`fallback`]).
//!
//! When every tier fails the result is a synthetic `FAIL` envelope and a
//! non-empty error list.

pub mod extract;
pub mod fallback;
pub mod isolate;
pub mod scanner;

use serde_json::Value;
use tracing::debug;

use crate::core::types::{ResponseEnvelope, Status};

pub use extract::{extract_payload, extract_thinking};
pub use scanner::unescape;

/// Tier that produced the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    Direct,
    FieldIsolation,
    PatternFallback,
    Failed,
}

impl ParseTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseTier::Direct => "direct",
            ParseTier::FieldIsolation => "field_isolation",
            ParseTier::PatternFallback => "pattern_fallback",
            ParseTier::Failed => "failed",
        }
    }
}

/// Result of [`parse_response`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub envelope: ResponseEnvelope,
    /// Parse errors; empty unless `tier` is [`ParseTier::Failed`].
    pub errors: Vec<String>,
    pub tier: ParseTier,
}

/// Run the parse cascade over `raw`. `request_id` fills a missing id.
pub fn parse_response(raw: &str, request_id: &str) -> ParseOutcome {
    let payload = extract_payload(raw);

    let detail = match payload {
        Some(payload) => match serde_json::from_str::<Value>(payload) {
            Ok(value) => match envelope_from_value(value, request_id) {
                Some(envelope) => return outcome(envelope, ParseTier::Direct),
                None => "payload is not a JSON object".to_string(),
            },
            Err(err) => {
                debug!(error = %err, "direct parse failed; isolating content fields");
                match isolate::parse_isolated(payload)
                    .ok()
                    .and_then(|value| envelope_from_value(value, request_id))
                {
                    Some(envelope) => return outcome(envelope, ParseTier::FieldIsolation),
                    None => err.to_string(),
                }
            }
        },
        None => "no JSON payload found".to_string(),
    };

    if let Some(envelope) = fallback::pattern_fallback(raw, request_id) {
        debug!(
            artifacts = envelope.artifacts.len(),
            "pattern fallback recovered artifacts"
        );
        return outcome(envelope, ParseTier::PatternFallback);
    }

    ParseOutcome {
        envelope: ResponseEnvelope::terminal(
            request_id,
            Status::Fail,
            format!("invalid JSON in response (check escaping of content fields): {detail}"),
        ),
        errors: vec![format!("response is not a valid ResponseEnvelope: {detail}")],
        tier: ParseTier::Failed,
    }
}

fn outcome(envelope: ResponseEnvelope, tier: ParseTier) -> ParseOutcome {
    ParseOutcome {
        envelope,
        errors: Vec::new(),
        tier,
    }
}

/// Decode an object into an envelope, filling a missing request id.
///
/// Wrong-shaped `artifacts`, `evidence`, and `next_actions` decode to their
/// empty forms.
fn envelope_from_value(value: Value, request_id: &str) -> Option<ResponseEnvelope> {
    if !value.is_object() {
        return None;
    }
    let mut envelope: ResponseEnvelope = serde_json::from_value(value).ok()?;
    if envelope.request_id.trim().is_empty() {
        envelope.request_id = request_id.to_string();
    }
    Some(envelope)
}
