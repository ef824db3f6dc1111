//! Pre-persistence moderation gate.
//!
//! Every submission is screened before it is stored. The gate asks a
//! [`Classifier`] for a verdict, bounding each attempt with a timeout and
//! retrying a transient failure at most once. When no verdict can be obtained
//! the [`FailurePolicy`] decides; the default rejects.
//!
//! # State machine
//!
//! ```text
//! Pending ──classifier ADMIT──────────────────► Admit
//!    │    ──classifier REJECT─────────────────► Reject(Policy)
//!    └────unavailable──► policy: FailClosed ──► Reject(Unscreened)
//!                                FailOpen   ──► Admit
//! ```
//!
//! `screen` always returns a terminal verdict; nothing stays pending.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

/// Fixed instruction given to language-model classifiers.
pub const POLICY_INSTRUCTION: &str = "You screen anonymous messages before delivery. \
Reject messages containing profanity, hate speech, threats, harassment or sexual content \
directed at the recipient. Admit neutral, constructive or positive messages, including \
criticism that is not abusive. Reply with exactly one line: ADMIT, or REJECT: <short reason>.";

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Classifier verdict on a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Text may be delivered
    Admissible,
    /// Text violates the policy
    Inadmissible {
        /// Short human-readable reason
        reason: String,
    },
}

/// Why no verdict could be obtained.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    /// Attempt exceeded the gate's timeout
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    /// Network or service failure
    #[error("classifier transport error: {0}")]
    Transport(String),

    /// The classifier answered, but not in the expected form
    #[error("malformed classifier reply: {0}")]
    MalformedReply(String),

    /// Submission carried ciphertext only; nothing to classify
    #[error("no screening text supplied")]
    NoScreeningText,
}

impl ClassifierError {
    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// A content classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify `text` against the moderation policy.
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

/// Parse a classifier reply of the form `ADMIT` or `REJECT: <reason>`.
///
/// Only the first non-empty line counts. Anything else is malformed, never an
/// implicit admit.
pub fn parse_verdict(reply: &str) -> Result<Classification, ClassifierError> {
    let line = reply.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();

    let (head, rest) = match line.split_once(':') {
        Some((head, rest)) => (head.trim(), rest.trim()),
        None => (line.trim_end_matches(['.', '!']), ""),
    };

    if head.eq_ignore_ascii_case("ADMIT") && rest.is_empty() {
        Ok(Classification::Admissible)
    } else if head.eq_ignore_ascii_case("REJECT") {
        let reason = if rest.is_empty() { "policy violation" } else { rest };
        Ok(Classification::Inadmissible { reason: reason.to_string() })
    } else {
        let preview: String = line.chars().take(64).collect();
        Err(ClassifierError::MalformedReply(preview))
    }
}

/// What to do when no verdict can be obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject unscreened messages.
    #[default]
    FailClosed,
    /// Admit unscreened messages.
    FailOpen,
}

/// Gate configuration.
#[derive(Debug, Clone, Copy)]
pub struct ModerationConfig {
    /// Bound on each classifier attempt
    pub timeout: Duration,
    /// Retries after a transient failure, clamped to 1
    pub max_retries: u8,
    /// Resolution when the classifier is unavailable
    pub policy: FailurePolicy,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_TIMEOUT, max_retries: 1, policy: FailurePolicy::FailClosed }
    }
}

/// Why a message was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The classifier found a policy violation
    Policy(String),
    /// No verdict was available and the gate fails closed
    Unscreened,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Policy(reason) => write!(f, "rejected by moderation: {reason}"),
            Self::Unscreened => f.write_str("message could not be screened"),
        }
    }
}

/// Terminal moderation verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Persist the message
    Admit,
    /// Drop the message
    Reject(RejectReason),
}

/// Result of screening one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationOutcome {
    /// Final verdict
    pub verdict: Verdict,
    /// Set when the verdict came from the failure policy
    pub unavailable: Option<ClassifierError>,
    /// Classifier calls made (0 when there was no text)
    pub attempts: u8,
}

/// Screens submissions before persistence.
#[derive(Clone)]
pub struct ModerationGate {
    classifier: Arc<dyn Classifier>,
    config: ModerationConfig,
}

impl ModerationGate {
    /// Gate over `classifier`.
    pub fn new(classifier: Arc<dyn Classifier>, config: ModerationConfig) -> Self {
        let config = ModerationConfig { max_retries: config.max_retries.min(1), ..config };
        Self { classifier, config }
    }

    /// Effective configuration.
    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    /// Screen `text`. `None` means the submission carried ciphertext only.
    pub async fn screen(&self, text: Option<&str>) -> ModerationOutcome {
        let Some(text) = text else {
            return self.resolve_unavailable(ClassifierError::NoScreeningText, 0);
        };

        let mut attempts = 0u8;
        loop {
            attempts += 1;

            let attempt = self.classifier.classify(text);
            let result = tokio::time::timeout(self.config.timeout, attempt)
                .await
                .unwrap_or(Err(ClassifierError::Timeout(self.config.timeout)));

            match result {
                Ok(Classification::Admissible) => {
                    return ModerationOutcome {
                        verdict: Verdict::Admit,
                        unavailable: None,
                        attempts,
                    };
                },
                Ok(Classification::Inadmissible { reason }) => {
                    tracing::info!(%reason, "submission rejected by classifier");
                    return ModerationOutcome {
                        verdict: Verdict::Reject(RejectReason::Policy(reason)),
                        unavailable: None,
                        attempts,
                    };
                },
                Err(err) if err.is_transient() && attempts <= self.config.max_retries => {
                    tracing::debug!(error = %err, attempts, "classifier attempt failed, retrying");
                },
                Err(err) => return self.resolve_unavailable(err, attempts),
            }
        }
    }

    fn resolve_unavailable(&self, cause: ClassifierError, attempts: u8) -> ModerationOutcome {
        let verdict = match self.config.policy {
            FailurePolicy::FailClosed => Verdict::Reject(RejectReason::Unscreened),
            FailurePolicy::FailOpen => Verdict::Admit,
        };

        tracing::warn!(
            error = %cause,
            policy = ?self.config.policy,
            admitted = verdict == Verdict::Admit,
            "moderation unavailable, applying failure policy"
        );

        ModerationOutcome { verdict, unavailable: Some(cause), attempts }
    }
}

impl fmt::Debug for ModerationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModerationGate").field("config", &self.config).finish_non_exhaustive()
    }
}
