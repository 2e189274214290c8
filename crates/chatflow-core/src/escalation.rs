//! Deadline, retry and escalation configuration
//!
//! Waiting steps may carry a [`DeadlineConfig`]: while the retry budget
//! lasts, the waiting user is re-prompted every `retry_interval`; once it
//! is exhausted the configured escalation recipients are notified and the
//! execution either keeps waiting (advisory) or is failed, per
//! [`EscalationOutcome`].
//!
//! Deadlines are always persisted as absolute timestamps. The helpers here
//! only compute the relative offsets; the scheduler turns them into
//! `deadline_at` stamps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::step::MessageContent;

/// What happens once retries are exhausted and escalation has fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Escalation is advisory; the execution keeps waiting for the user
    KeepWaiting,
    /// The waiting step and the execution are failed
    FailExecution,
}

/// Escalation target and message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Chat identities to notify; may differ from the waiting user
    pub recipients: Vec<String>,
    pub message: MessageContent,
    #[serde(default = "default_outcome")]
    pub on_exhausted: EscalationOutcome,
}

fn default_outcome() -> EscalationOutcome {
    EscalationOutcome::KeepWaiting
}

/// Deadline and retry policy of a waiting step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Total time the step is willing to wait before escalation is due
    /// (when no retries are configured)
    #[serde(with = "duration_secs")]
    pub deadline: Duration,

    /// Number of re-prompts sent before escalating
    #[serde(default)]
    pub retry_count: u32,

    /// Interval between re-prompts
    #[serde(default = "default_retry_interval", with = "duration_secs")]
    pub retry_interval: Duration,

    /// Message sent on each retry; defaults to re-sending nothing but the
    /// configured text is usually a nudge ("are you still there?")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_message: Option<MessageContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationConfig>,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(300)
}

/// Decision taken by the escalation sweep for one due wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepDecision {
    /// Send the retry message and come back after `next_deadline_in`
    Retry { next_deadline_in: Duration },
    /// Retry budget exhausted; notify escalation recipients
    Escalate,
}

impl DeadlineConfig {
    /// Offset of the first deadline after the step starts waiting.
    ///
    /// With retries configured the first prompt is due one retry interval
    /// in; without retries the single deadline is the escalation point.
    pub fn initial_deadline(&self) -> Duration {
        if self.retry_count > 0 {
            self.retry_interval
        } else {
            self.deadline
        }
    }

    /// What the sweep should do given how many retries were already sent
    pub fn decide(&self, retries_sent: u32) -> SweepDecision {
        if retries_sent < self.retry_count {
            SweepDecision::Retry {
                next_deadline_in: self.retry_interval,
            }
        } else {
            SweepDecision::Escalate
        }
    }
}

/// Whole-execution overdue notification configured on the Start step.
/// Keyed off the execution's `started_at`, fired at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverdueConfig {
    #[serde(with = "duration_secs")]
    pub deadline: Duration,
    pub recipients: Vec<String>,
    pub message: MessageContent,
}

/// Serde support for Duration as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(deadline_m: u64, retry_count: u32, interval_m: u64) -> DeadlineConfig {
        DeadlineConfig {
            deadline: Duration::from_secs(deadline_m * 60),
            retry_count,
            retry_interval: Duration::from_secs(interval_m * 60),
            retry_message: None,
            escalation: None,
        }
    }

    #[test]
    fn retry_schedule_matches_timeline() {
        // deadline=10m, retry_count=2, retry_interval=5m:
        // retries due at t=5m and t=10m, escalation due at t=15m
        let cfg = config(10, 2, 5);
        assert_eq!(cfg.initial_deadline(), Duration::from_secs(300));
        assert_eq!(
            cfg.decide(0),
            SweepDecision::Retry {
                next_deadline_in: Duration::from_secs(300)
            }
        );
        assert_eq!(
            cfg.decide(1),
            SweepDecision::Retry {
                next_deadline_in: Duration::from_secs(300)
            }
        );
        assert_eq!(cfg.decide(2), SweepDecision::Escalate);
    }

    #[test]
    fn no_retries_escalates_at_deadline() {
        let cfg = config(60, 0, 5);
        assert_eq!(cfg.initial_deadline(), Duration::from_secs(3600));
        assert_eq!(cfg.decide(0), SweepDecision::Escalate);
    }

    #[test]
    fn config_serializes_durations_as_seconds() {
        let cfg = config(10, 2, 5);
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["deadline"], 600);
        assert_eq!(json["retry_interval"], 300);

        let back: DeadlineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.deadline, Duration::from_secs(600));
    }
}
