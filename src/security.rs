//! Prompt screening: injection heuristics, PII counting, content hashing and
//! a redacted preview that is safe to put in logs.
//!
//! Everything here is pure.  A `SecurityAnalyzer` is built once at startup
//! (built-in rules plus any operator supplied extras) and shared by every
//! request; `analyze` never mutates it.

use std::collections::BTreeMap;
use std::fmt;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Categories of personally identifiable information we count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiCategory {
    Email,
    Ssn,
    CreditCard,
    Phone,
    IpAddress,
}

impl PiiCategory {
    pub const ALL: [PiiCategory; 5] = [
        PiiCategory::Email,
        PiiCategory::Ssn,
        PiiCategory::CreditCard,
        PiiCategory::Phone,
        PiiCategory::IpAddress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiCategory::Email => "email",
            PiiCategory::Ssn => "ssn",
            PiiCategory::CreditCard => "credit_card",
            PiiCategory::Phone => "phone",
            PiiCategory::IpAddress => "ip_address",
        }
    }

    /// Position in `ALL`; used to index fixed per-category instrument arrays.
    pub fn index(&self) -> usize {
        *self as usize
    }

    fn pattern(&self) -> &'static Regex {
        &PII_PATTERNS[self.index()]
    }
}

impl fmt::Display for PiiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Indexed by `PiiCategory::index`.
static PII_PATTERNS: Lazy<[Regex; 5]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b").unwrap(),
        Regex::new(r"(?i)\b\d{3}-?\d{2}-?\d{4}\b").unwrap(),
        Regex::new(r"(?i)\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").unwrap(),
        Regex::new(r"(?i)\b(?:\+?1[-.]?)?\(?([0-9]{3})\)?[-.]?([0-9]{3})[-.]?([0-9]{4})\b").unwrap(),
        Regex::new(r"(?i)\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
    ]
});

/// Built-in injection heuristics, evaluated in this order.
const BUILTIN_INJECTION_RULES: &[(&str, &str)] = &[
    (
        "ignore_previous_instructions",
        r"(ignore|forget|disregard).*previous.*instructions?",
    ),
    ("role_reassignment", r"(system|assistant|you are).*now.*"),
    ("instruction_override", r"(new instructions?|override|replace)"),
    ("persona_request", r"(act as|pretend to be|you must)"),
    (
        "credential_request",
        r"(tell me|reveal|show me).*(password|api.?key|secret|token)",
    ),
    (
        "verbatim_repetition",
        r"(repeat|echo|output).*(the|all|every).*(word|character)",
    ),
    ("destructive_action", r"(delete|remove|clear).*(all|everything|data)"),
    ("special_token", r"<\|.*\|>"),
    ("system_marker", r"\[.*system.*\]"),
];

static BUILTIN_RULES: Lazy<Vec<InjectionRule>> = Lazy::new(|| {
    BUILTIN_INJECTION_RULES
        .iter()
        .map(|(name, pattern)| InjectionRule {
            name: (*name).to_string(),
            matcher: Matcher::Pattern(Regex::new(&format!("(?i){}", pattern)).unwrap()),
        })
        .collect()
});

const MAX_EXTRA_PATTERNS: usize = 50;
const MAX_PATTERN_LEN: usize = 500;

/// Operator supplied additions to the injection rule table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Regular expressions, matched case-insensitively.
    #[serde(default)]
    pub injection_patterns: Vec<String>,
    /// Literal phrases, matched case-insensitively anywhere in the text.
    #[serde(default)]
    pub injection_phrases: Vec<String>,
}

#[derive(Clone)]
enum Matcher {
    Pattern(Regex),
    Phrases(AhoCorasick),
}

/// One named entry of the injection table.
#[derive(Clone)]
pub struct InjectionRule {
    name: String,
    matcher: Matcher,
}

impl InjectionRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_match(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Pattern(re) => re.is_match(text),
            Matcher::Phrases(ac) => ac.is_match(text),
        }
    }
}

/// Result of screening one prompt.  Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityFinding {
    pub injection_detected: bool,
    pub pii_counts: BTreeMap<PiiCategory, usize>,
    pub content_hash: String,
    pub preview: String,
}

impl SecurityFinding {
    pub fn pii_detected(&self) -> bool {
        !self.pii_counts.is_empty()
    }

    /// Sum of matches across all categories.
    pub fn pii_total(&self) -> usize {
        self.pii_counts.values().sum()
    }

    /// Comma separated category names, e.g. `email,phone`.
    pub fn pii_category_list(&self) -> String {
        self.pii_counts
            .keys()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Ordered injection rule table plus the fixed PII detectors.
#[derive(Clone)]
pub struct SecurityAnalyzer {
    rules: Vec<InjectionRule>,
}

impl Default for SecurityAnalyzer {
    fn default() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
        }
    }
}

impl SecurityAnalyzer {
    /// Built-in rules followed by the configured extras.  Unusable extras are
    /// dropped with a warning rather than failing startup.
    pub fn new(cfg: &SecurityConfig) -> Self {
        let mut rules = BUILTIN_RULES.clone();

        let mut patterns = cfg.injection_patterns.clone();
        if patterns.len() > MAX_EXTRA_PATTERNS {
            tracing::warn!(
                pattern_count = patterns.len(),
                limit = MAX_EXTRA_PATTERNS,
                "extra injection pattern list truncated"
            );
            patterns.truncate(MAX_EXTRA_PATTERNS);
        }
        for (idx, pat) in patterns.iter().enumerate() {
            if pat.len() > MAX_PATTERN_LEN {
                tracing::warn!(
                    len = pat.len(),
                    limit = MAX_PATTERN_LEN,
                    "dropping oversized injection pattern"
                );
                continue;
            }
            match Regex::new(&format!("(?i){}", pat)) {
                Ok(re) => rules.push(InjectionRule {
                    name: format!("custom_pattern_{}", idx),
                    matcher: Matcher::Pattern(re),
                }),
                Err(err) => {
                    tracing::warn!(pattern = %pat, error = ?err, "failed to compile injection pattern, ignoring");
                }
            }
        }

        let phrases: Vec<String> = cfg
            .injection_phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if !phrases.is_empty() {
            match AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .build(&phrases)
            {
                Ok(ac) => rules.push(InjectionRule {
                    name: "custom_phrases".to_string(),
                    matcher: Matcher::Phrases(ac),
                }),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to build injection phrase matcher, ignoring");
                }
            }
        }

        Self { rules }
    }

    pub fn rules(&self) -> &[InjectionRule] {
        &self.rules
    }

    /// Name of the first rule matching `text`, if any.
    pub fn matched_rule(&self, text: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(text))
            .map(|rule| rule.name())
    }

    pub fn detect_injection(&self, text: &str) -> bool {
        self.matched_rule(text).is_some()
    }

    pub fn analyze(&self, text: &str) -> SecurityFinding {
        SecurityFinding {
            injection_detected: self.detect_injection(text),
            pii_counts: detect_pii(text),
            content_hash: hash_prompt(text),
            preview: redact_preview(text, DEFAULT_PREVIEW_LEN),
        }
    }
}

pub const DEFAULT_PREVIEW_LEN: usize = 50;
const PREVIEW_EDGE: usize = 20;

/// SHA-256 of the UTF-8 bytes, lowercase hex.
pub fn hash_prompt(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Texts up to `max_len` characters are returned as is; longer ones keep the
/// first and last 20 characters around a literal `...`.
pub fn redact_preview(text: &str, max_len: usize) -> String {
    let len = text.chars().count();
    if len <= max_len {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_EDGE).collect();
    let tail: String = text.chars().skip(len - PREVIEW_EDGE).collect();
    format!("{}...{}", head, tail)
}

/// Non-overlapping match count per category.  Categories without a match are
/// absent from the map.
pub fn detect_pii(text: &str) -> BTreeMap<PiiCategory, usize> {
    PiiCategory::ALL
        .iter()
        .filter_map(|cat| {
            let count = cat.pattern().find_iter(text).count();
            (count > 0).then_some((*cat, count))
        })
        .collect()
}
