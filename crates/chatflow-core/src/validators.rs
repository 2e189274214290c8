//! Step validators
//!
//! The message validator decides whether an inbound signal satisfies a
//! waiting step and extracts its normalized payload. Every evaluation,
//! valid or not, becomes a write-once MessageValidation audit row upstream.
//!
//! The time validator is the single deadline predicate consulted by the
//! escalation sweep.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use chatflow_contracts::MessageType;

use crate::step::ExpectedReply;
use crate::variables::VarValue;

/// Result of validating one inbound message against a waiting step
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    /// Stable validator tag persisted on the audit row
    pub validator_type: &'static str,
    /// Normalized payload extracted from a valid message
    pub extracted: Option<VarValue>,
    /// Human-readable reason when invalid
    pub reason: Option<String>,
}

impl ValidationOutcome {
    fn valid(validator_type: &'static str, extracted: VarValue) -> Self {
        Self {
            is_valid: true,
            validator_type,
            extracted: Some(extracted),
            reason: None,
        }
    }

    fn invalid(validator_type: &'static str, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            validator_type,
            extracted: None,
            reason: Some(reason.into()),
        }
    }
}

fn qr_payload_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=:_-]{8,}$").expect("valid regex"))
}

/// Validates inbound messages against the step's expected reply shape
pub struct MessageValidator;

impl MessageValidator {
    pub fn validate(
        expect: &ExpectedReply,
        message_type: MessageType,
        raw: &str,
    ) -> ValidationOutcome {
        match expect {
            ExpectedReply::FreeText => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    ValidationOutcome::invalid("free_text", "empty message")
                } else {
                    ValidationOutcome::valid("free_text", VarValue::String(trimmed.to_string()))
                }
            }

            ExpectedReply::QrCode => {
                if message_type != MessageType::QrCode {
                    return ValidationOutcome::invalid(
                        "qr_code",
                        format!("expected a QR scan, got {message_type}"),
                    );
                }
                let payload = raw.trim();
                if qr_payload_regex().is_match(payload) {
                    ValidationOutcome::valid("qr_code", VarValue::String(payload.to_string()))
                } else {
                    ValidationOutcome::invalid("qr_code", "malformed QR payload")
                }
            }

            ExpectedReply::Selection { options } => {
                let reply = raw.trim();

                // Accept a 1-based ordinal reply ("2") or the option label
                if let Ok(ordinal) = reply.parse::<usize>() {
                    if ordinal >= 1 && ordinal <= options.len() {
                        return ValidationOutcome::valid(
                            "selection",
                            VarValue::String(options[ordinal - 1].clone()),
                        );
                    }
                }
                if let Some(option) = options.iter().find(|o| o.eq_ignore_ascii_case(reply)) {
                    return ValidationOutcome::valid(
                        "selection",
                        VarValue::String(option.clone()),
                    );
                }
                ValidationOutcome::invalid(
                    "selection",
                    format!("'{reply}' is not one of the offered options"),
                )
            }
        }
    }
}

/// Deadline predicate used by the escalation sweep
pub struct TimeValidator;

impl TimeValidator {
    /// True exactly when `now >= deadline_at`. Deadlines are persisted as
    /// absolute stamps, so the sweep consults this against the stored value.
    pub fn has_elapsed(deadline_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= deadline_at
    }
}
