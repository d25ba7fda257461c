//! Task classifier: Decides how demanding an inbound request is.
//!
//! Order of checks:
//! 1. short text equal to a known acknowledgement → `SimpleAck`
//! 2. complex-task keywords → `Complex` (wins over status patterns)
//! 3. status-query patterns → `StatusQuery`
//! 4. anything else → `Complex`

use regex_lite::Regex;
use senseloop_core::tier::TaskComplexity;

const ACKNOWLEDGEMENTS: &[&str] = &[
    "ok", "okay", "k", "kk", "thanks", "thank you", "thx", "ty", "cool", "nice", "great",
    "got it", "sounds good", "perfect", "yes", "yep", "yeah", "no", "nope", "sure", "lol",
    "haha", "👍", "❤️",
];

const COMPLEX_PATTERN: &str = r"(?i)\b(?:build|implement|debug|fix|plan|research|send|schedule|write|create|refactor|deploy|analy[sz]e|investigate|remind|draft|email|code)\b";

const STATUS_PATTERN: &str = r"(?i)\bstatus\b|\bwhat time\b|\bhow are you\b|\bare you there\b|\bwhat are you (?:doing|up to)\b|\bwhat'?s up\b|\bweather\b|\buptime\b|\bare you (?:awake|online)\b";

#[derive(Debug)]
pub struct TaskClassifier {
    ack_max_chars: usize,
    complex: Regex,
    status: Regex,
}

impl TaskClassifier {
    pub fn new(ack_max_chars: usize) -> Result<Self, regex_lite::Error> {
        Ok(Self {
            ack_max_chars,
            complex: Regex::new(COMPLEX_PATTERN)?,
            status: Regex::new(STATUS_PATTERN)?,
        })
    }

    pub fn classify(&self, prompt: &str) -> TaskComplexity {
        let trimmed = prompt.trim();
        if trimmed.chars().count() <= self.ack_max_chars && is_acknowledgement(trimmed) {
            return TaskComplexity::SimpleAck;
        }
        if self.complex.is_match(trimmed) {
            return TaskComplexity::Complex;
        }
        if self.status.is_match(trimmed) {
            return TaskComplexity::StatusQuery;
        }
        TaskComplexity::Complex
    }
}

fn is_acknowledgement(text: &str) -> bool {
    let normalized = text
        .to_lowercase()
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ',' | '~') || c.is_whitespace())
        .to_string();
    ACKNOWLEDGEMENTS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TaskClassifier {
        TaskClassifier::new(40).unwrap()
    }

    #[test]
    fn acknowledgements() {
        let c = classifier();
        for text in ["ok", "Thanks!", "  got it.  ", "👍", "Sounds good!!"] {
            assert_eq!(c.classify(text), TaskComplexity::SimpleAck, "input: {text}");
        }
    }

    #[test]
    fn long_text_is_never_an_ack() {
        let c = TaskClassifier::new(3).unwrap();
        assert_ne!(c.classify("thank you"), TaskComplexity::SimpleAck);
    }

    #[test]
    fn status_queries() {
        let c = classifier();
        assert_eq!(c.classify("what's the status?"), TaskComplexity::StatusQuery);
        assert_eq!(c.classify("are you there"), TaskComplexity::StatusQuery);
        assert_eq!(c.classify("How's the weather today"), TaskComplexity::StatusQuery);
    }

    #[test]
    fn complex_keywords_win_over_status() {
        let c = classifier();
        assert_eq!(
            c.classify("what's the status of the build?"),
            TaskComplexity::Complex
        );
        assert_eq!(
            c.classify("please schedule lunch with Kim"),
            TaskComplexity::Complex
        );
    }

    #[test]
    fn unknown_defaults_to_complex() {
        assert_eq!(
            classifier().classify("tell me a story about lighthouses"),
            TaskComplexity::Complex
        );
    }
}
