//! Guardrail chain applied to LLM output before it reaches an end user.
//!
//! Order: profanity filter, PII leak scan, policy keyword checks, escalation
//! heuristics. The first rewrite-worthy hit wins; escalation still publishes
//! the reply but flags the conversation for out-of-band handling.

use log::info;
use regex::Regex;
use std::sync::OnceLock;

use super::policy::PolicyDocument;

#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailOutcome {
    Accept,
    /// Replace the reply with the policy's fallback copy.
    Rewrite { reason: String },
    /// Deliver the reply but enqueue an escalation record.
    Escalate { reason: String },
}

impl GuardrailOutcome {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Accept => None,
            Self::Rewrite { reason } | Self::Escalate { reason } => Some(reason),
        }
    }
}

const PROFANITY: &[&str] = &[
    "damn", "hell", "bastard", "crap", "bollocks", "bullshit", "asshole",
];

const LOW_CONFIDENCE_MARKERS: &[&str] = &[
    "i don't know",
    "i am not sure",
    "i'm not sure",
    "i cannot help",
    "i can't help",
];

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn card_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap())
}

fn ssn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap())
}

pub struct GuardrailChain;

impl GuardrailChain {
    /// Run the chain over a candidate reply.
    pub fn evaluate(
        policy: &PolicyDocument,
        user_message: &str,
        reply: &str,
    ) -> GuardrailOutcome {
        let lowered_reply = reply.to_lowercase();

        for term in PROFANITY {
            if contains_word(&lowered_reply, term) {
                info!("guardrail rewrite: profanity ({})", term);
                return GuardrailOutcome::Rewrite {
                    reason: "profanity".to_string(),
                };
            }
        }

        if email_pattern().is_match(reply)
            || card_pattern().is_match(reply)
            || ssn_pattern().is_match(reply)
        {
            info!("guardrail rewrite: pii leak");
            return GuardrailOutcome::Rewrite {
                reason: "pii_leak".to_string(),
            };
        }

        for keyword in &policy.blocked_keywords {
            if lowered_reply.contains(keyword) {
                info!("guardrail rewrite: policy keyword ({})", keyword);
                return GuardrailOutcome::Rewrite {
                    reason: "policy_keyword".to_string(),
                };
            }
        }

        let lowered_message = user_message.to_lowercase();
        for keyword in &policy.escalation_keywords {
            if contains_word(&lowered_message, keyword) {
                return GuardrailOutcome::Escalate {
                    reason: "user_requested_escalation".to_string(),
                };
            }
        }

        if reply.trim().is_empty() {
            return GuardrailOutcome::Rewrite {
                reason: "empty_reply".to_string(),
            };
        }
        for marker in LOW_CONFIDENCE_MARKERS {
            if lowered_reply.contains(marker) {
                return GuardrailOutcome::Escalate {
                    reason: "low_confidence".to_string(),
                };
            }
        }

        GuardrailOutcome::Accept
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicyDocument {
        PolicyDocument::from_json(&serde_json::json!({
            "blocked_keywords": ["competitor"],
            "escalation_keywords": ["human"],
        }))
    }

    #[test]
    fn clean_reply_is_accepted() {
        let outcome = GuardrailChain::evaluate(
            &policy(),
            "how do I reset?",
            "Hold the button for five seconds.",
        );
        assert_eq!(outcome, GuardrailOutcome::Accept);
    }

    #[test]
    fn profanity_triggers_rewrite() {
        let outcome = GuardrailChain::evaluate(&policy(), "hi", "That is a damn shame.");
        assert_eq!(outcome.reason(), Some("profanity"));
        assert!(matches!(outcome, GuardrailOutcome::Rewrite { .. }));
    }

    #[test]
    fn email_leak_triggers_rewrite() {
        let outcome = GuardrailChain::evaluate(
            &policy(),
            "hi",
            "Contact jane.doe@example.com for a refund.",
        );
        assert_eq!(outcome.reason(), Some("pii_leak"));
    }

    #[test]
    fn card_number_triggers_rewrite() {
        let outcome = GuardrailChain::evaluate(
            &policy(),
            "hi",
            "Your card 4111 1111 1111 1111 is on file.",
        );
        assert_eq!(outcome.reason(), Some("pii_leak"));
    }

    #[test]
    fn policy_keyword_triggers_rewrite() {
        let outcome = GuardrailChain::evaluate(&policy(), "hi", "Try our competitor instead.");
        assert_eq!(outcome.reason(), Some("policy_keyword"));
    }

    #[test]
    fn explicit_request_escalates_but_publishes() {
        let outcome = GuardrailChain::evaluate(
            &policy(),
            "let me talk to a human please",
            "Sure, connecting you now.",
        );
        assert!(matches!(outcome, GuardrailOutcome::Escalate { .. }));
    }

    #[test]
    fn low_confidence_escalates() {
        let outcome =
            GuardrailChain::evaluate(&policy(), "what is the warranty", "I'm not sure about that.");
        assert_eq!(outcome.reason(), Some("low_confidence"));
    }

    #[test]
    fn profanity_matches_whole_words_only() {
        // "hello" contains "hell" as a substring but not as a word.
        let outcome = GuardrailChain::evaluate(&policy(), "hi", "Hello there, happy to help.");
        assert_eq!(outcome, GuardrailOutcome::Accept);
    }
}
