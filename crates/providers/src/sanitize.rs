//! Response sanitizing.
//!
//! Applied to every extracted `result` before it leaves the engine, in order:
//!
//! 1. strip a leading meta-commentary prefix ("Sent a reply about X: ...")
//! 2. replace text that is nothing but meta-commentary with a placeholder
//! 3. strip internal reasoning and markup blocks
//! 4. strip correlation-id-shaped tokens
//! 5. collapse leftover whitespace
//!
//! Text starting with `\verbatim ` skips steps 1 and 2 only.
//!
//! Everything removed is logged under the `senseloop::diagnostics` target and
//! never handed back to callers of the engine.

use regex_lite::Regex;
use tracing::debug;

/// Substituted for a response that only narrates an action.
pub const MESSAGE_NOT_DELIVERED: &str = "[message not delivered]";

/// Opt-out prefix for meta-commentary detection.
pub const VERBATIM_PREFIX: &str = "\\verbatim ";

const INTERNAL_TAGS: [&str; 5] = [
    "thinking",
    "reasoning",
    "internal",
    "system-reminder",
    "function_calls",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    MetaPrefix,
    MetaOnly,
    InternalBlock,
    CorrelationId,
}

/// A piece of text the sanitizer took out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub kind: RemovalKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    pub removed: Vec<Removal>,
}

/// Compiled sanitizing patterns.
#[derive(Debug)]
pub struct Sanitizer {
    meta_prefix: Regex,
    meta_only: Vec<Regex>,
    blocks: Vec<Regex>,
    stray_tags: Regex,
    correlation_ids: Regex,
    trailing_ws: Regex,
    blank_runs: Regex,
    space_runs: Regex,
}

impl Sanitizer {
    pub fn new() -> Result<Self, regex_lite::Error> {
        let meta_prefix = Regex::new(
            r"(?i)^\s*(?:sent an? (?:reply|message|response)(?: to [^:\n]+?)?(?: about [^:\n]*?)?|i sent [^:\n]*?|replied with|here'?s my (?:response|reply)|responding with)\s*:\s*",
        )?;

        let meta_only = vec![
            Regex::new(
                r"(?i)^(?:i )?(?:sent|replied|responded|messaged|texted)(?: an?)?(?: (?:reply|message|response))?(?: to [^.:\n]+)?(?: about [^:\n]*)?\.?$",
            )?,
            Regex::new(r"(?i)^(?:done|message sent|reply sent)[.!]?$")?,
            Regex::new(r"(?i)^i(?:'ve| have) (?:sent|replied|responded)\b[^:]*$")?,
        ];

        let blocks = INTERNAL_TAGS
            .iter()
            .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")))
            .collect::<Result<Vec<_>, _>>()?;

        let stray_tags = Regex::new(&format!(
            r"(?im)^[ \t]*</?(?:{})\b[^>]*>[ \t]*$\n?",
            INTERNAL_TAGS.join("|")
        ))?;

        let correlation_ids = Regex::new(
            r"\b(?:toolu|msg|req)_[A-Za-z0-9]{8,}\b|\[[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\]",
        )?;

        Ok(Self {
            meta_prefix,
            meta_only,
            blocks,
            stray_tags,
            correlation_ids,
            trailing_ws: Regex::new(r"(?m)[ \t]+$")?,
            blank_runs: Regex::new(r"\n{3,}")?,
            space_runs: Regex::new(r"[ \t]{2,}")?,
        })
    }

    pub fn sanitize(&self, raw: &str) -> Sanitized {
        let mut removed = Vec::new();

        let (mut text, verbatim) = match raw.strip_prefix(VERBATIM_PREFIX) {
            Some(rest) => (rest.to_string(), true),
            None => (raw.to_string(), false),
        };

        if !verbatim {
            let mut stripped_prefix = false;
            if let Some(m) = self.meta_prefix.find(&text) {
                removed.push(Removal {
                    kind: RemovalKind::MetaPrefix,
                    text: m.as_str().to_string(),
                });
                text = text[m.end()..].to_string();
                stripped_prefix = true;
            }

            let candidate = text.trim();
            let meta_only = (stripped_prefix && candidate.is_empty())
                || self.meta_only.iter().any(|re| re.is_match(candidate));
            if meta_only {
                removed.push(Removal {
                    kind: RemovalKind::MetaOnly,
                    text: candidate.to_string(),
                });
                log_removals(&removed);
                return Sanitized {
                    text: MESSAGE_NOT_DELIVERED.to_string(),
                    removed,
                };
            }
        }

        for re in self.blocks.iter().chain(std::iter::once(&self.stray_tags)) {
            text = strip(re, &text, RemovalKind::InternalBlock, &mut removed);
        }
        text = strip(
            &self.correlation_ids,
            &text,
            RemovalKind::CorrelationId,
            &mut removed,
        );

        let text = self.trailing_ws.replace_all(&text, "");
        let text = self.blank_runs.replace_all(&text, "\n\n");
        let text = self.space_runs.replace_all(&text, " ");
        let text = text.trim().to_string();

        log_removals(&removed);
        Sanitized { text, removed }
    }
}

fn strip(re: &Regex, text: &str, kind: RemovalKind, removed: &mut Vec<Removal>) -> String {
    let before = removed.len();
    removed.extend(re.find_iter(text).map(|m| Removal {
        kind,
        text: m.as_str().to_string(),
    }));
    if removed.len() == before {
        return text.to_string();
    }
    re.replace_all(text, "").into_owned()
}

fn log_removals(removed: &[Removal]) {
    for r in removed {
        debug!(target: "senseloop::diagnostics", kind = ?r.kind, removed = %r.text, "Sanitizer removed text");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new().unwrap()
    }

    #[test]
    fn plain_text_passes_through() {
        let out = sanitizer().sanitize("Dinner is at 7, see you there!");
        assert_eq!(out.text, "Dinner is at 7, see you there!");
        assert!(out.removed.is_empty());
    }

    #[test]
    fn strips_meta_prefix() {
        let out = sanitizer().sanitize("Sent a reply about dinner plans: Dinner is at 7.");
        assert_eq!(out.text, "Dinner is at 7.");
        assert_eq!(out.removed[0].kind, RemovalKind::MetaPrefix);

        let out = sanitizer().sanitize("Here's my response: sure thing");
        assert_eq!(out.text, "sure thing");
    }

    #[test]
    fn pure_meta_commentary_becomes_placeholder() {
        let s = sanitizer();
        for text in [
            "Sent a reply to Sam about the weekend.",
            "I replied.",
            "Done.",
            "Message sent!",
            "I've sent the updated itinerary to the family chat",
            "Sent a reply about dinner:",
        ] {
            assert_eq!(s.sanitize(text).text, MESSAGE_NOT_DELIVERED, "input: {text}");
        }
    }

    #[test]
    fn embedded_payload_is_not_meta_only() {
        let out = sanitizer().sanitize("I've sent this: the gate code is 4821");
        assert_ne!(out.text, MESSAGE_NOT_DELIVERED);
    }

    #[test]
    fn strips_internal_blocks() {
        let raw = "<thinking>\nthe user wants a time\n</thinking>\nMeet at noon.\n<system-reminder>keep it short</system-reminder>";
        let out = sanitizer().sanitize(raw);
        assert_eq!(out.text, "Meet at noon.");
        assert_eq!(
            out.removed
                .iter()
                .filter(|r| r.kind == RemovalKind::InternalBlock)
                .count(),
            2
        );
    }

    #[test]
    fn strips_stray_tag_lines() {
        let out = sanitizer().sanitize("<reasoning>\nOn my way.");
        assert_eq!(out.text, "On my way.");
    }

    #[test]
    fn strips_correlation_ids() {
        let raw = "Booked it toolu_01AbCdEfGh42 for you [123e4567-e89b-12d3-a456-426614174000] today";
        let out = sanitizer().sanitize(raw);
        assert_eq!(out.text, "Booked it for you today");
        assert_eq!(out.removed.len(), 2);
    }

    #[test]
    fn collapses_whitespace() {
        let out = sanitizer().sanitize("  one   two  \n\n\n\nthree\t\t\n");
        assert_eq!(out.text, "one two\n\nthree");
    }

    #[test]
    fn verbatim_skips_meta_detection_only() {
        let out = sanitizer().sanitize("\\verbatim Done. <thinking>x</thinking>");
        assert_eq!(out.text, "Done.");
        assert!(out.removed.iter().all(|r| r.kind == RemovalKind::InternalBlock));
    }
}
