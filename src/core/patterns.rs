//! Offline pattern matcher
//!
//! An ordered table of `(matcher, action, extractor)` rules. The first rule
//! whose regex matches the whole transcript wins; there is no scoring.
//! Matches carry a fixed, lower confidence.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use tracing::debug;

use super::{Action, Intent, IntentSource, TextNormalizer};
use crate::error::{VoiceError, VoiceResult};

/// Post-processes the named capture groups of a match
type Extractor = fn(BTreeMap<String, String>, &TextNormalizer) -> BTreeMap<String, String>;

/// One row of the pattern table
pub struct PatternRule {
    pub name: &'static str,
    pub action: Action,
    matcher: Regex,
    extract: Extractor,
}

impl PatternRule {
    fn new(name: &'static str, action: Action, pattern: &str, extract: Extractor) -> VoiceResult<Self> {
        let matcher = Regex::new(pattern)
            .map_err(|e| VoiceError::Config(format!("pattern '{}': {}", name, e)))?;
        Ok(Self {
            name,
            action,
            matcher,
            extract,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    /// Non-empty named groups, trimmed
    fn named_groups(&self, caps: &Captures) -> BTreeMap<String, String> {
        self.matcher
            .capture_names()
            .flatten()
            .filter_map(|name| {
                let value = caps.name(name)?.as_str().trim();
                (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn keep(entities: BTreeMap<String, String>, _: &TextNormalizer) -> BTreeMap<String, String> {
    entities
}

fn lowercase_kind(mut entities: BTreeMap<String, String>, _: &TextNormalizer) -> BTreeMap<String, String> {
    if let Some(kind) = entities.get_mut("kind") {
        *kind = kind.to_lowercase();
    }
    entities
}

/// Quantity as digits
fn quantity_entities(
    mut entities: BTreeMap<String, String>,
    normalizer: &TextNormalizer,
) -> BTreeMap<String, String> {
    if let Some(quantity) = entities.get_mut("quantity") {
        if let Some(n) = normalizer.parse_number(quantity) {
            *quantity = n.to_string();
        }
    }
    if let Some(unit) = entities.get_mut("unit") {
        *unit = unit.to_lowercase();
    }
    entities
}

fn note_entities(mut entities: BTreeMap<String, String>, _: &TextNormalizer) -> BTreeMap<String, String> {
    entities.insert("kind".to_string(), "note".to_string());
    entities
}

fn lowercase_view(mut entities: BTreeMap<String, String>, _: &TextNormalizer) -> BTreeMap<String, String> {
    if let Some(view) = entities.get_mut("view") {
        *view = view.to_lowercase();
    }
    entities
}

/// The built-in rule table, in evaluation order
fn default_rules() -> VoiceResult<Vec<PatternRule>> {
    Ok(vec![
        PatternRule::new(
            "add_note",
            Action::AddEntry,
            r"(?i)^(?:add|take|make) (?:a )?note(?: that| saying)?:? (?P<text>.+)$",
            note_entities,
        )?,
        PatternRule::new(
            "create_record",
            Action::CreateRecord,
            r"(?i)^(?:create|new|start) (?:a |an )?(?:new )?(?P<kind>job|customer|invoice|quote|estimate|appointment)(?: (?:called|named|titled|for))? (?P<title>.+)$",
            lowercase_kind,
        )?,
        PatternRule::new(
            "add_entry",
            Action::AddEntry,
            r"(?i)^(?:add|log|record|enter) (?P<quantity>\d+(?:\.\d+)?|an?|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve) (?P<unit>hours?|minutes?|miles?|parts?|items?|units?)(?: (?:of )?(?:to|for|on) (?P<target>.+))?$",
            quantity_entities,
        )?,
        PatternRule::new(
            "set_active_context",
            Action::SetActiveContext,
            r"(?i)^(?:switch to|select|work on|use) (?:the )?(?:job|customer|record|quote|invoice)(?: number)? (?P<record>.+)$",
            keep,
        )?,
        PatternRule::new(
            "navigate",
            Action::Navigate,
            r"(?i)^(?:go to|open|show(?: me)?|navigate to|take me to|switch to) (?:the |my )?(?P<view>[a-z][a-z ]*?)(?: (?:page|screen|view|tab))?$",
            lowercase_view,
        )?,
        PatternRule::new(
            "query",
            Action::Query,
            r"(?i)^(?P<query>(?:what|when|where|who|which|how many|how much|list|find|search for|look up)\b.+)$",
            keep,
        )?,
    ])
}

/// Response text for an offline match, keyed by action and entities
pub fn response_template(action: Action, entities: &BTreeMap<String, String>) -> String {
    let get = |slot: &str| entities.get(slot).map(String::as_str).unwrap_or_default();
    match action {
        Action::CreateRecord => format!("Creating {} \"{}\"", get("kind"), get("title")),
        Action::AddEntry if get("kind") == "note" => "Note added.".to_string(),
        Action::AddEntry => match entities.get("target") {
            Some(target) => format!("Adding {} {} to {}", get("quantity"), get("unit"), target),
            None => format!("Adding {} {}", get("quantity"), get("unit")),
        },
        Action::SetActiveContext => format!("Switched to {}", get("record")),
        Action::Navigate => format!("Opening {}", get("view")),
        Action::Query => format!("Looking up \"{}\"", get("query")),
        Action::Unknown => String::new(),
    }
}

/// Deterministic, local intent resolution
pub struct PatternMatcher {
    rules: Vec<PatternRule>,
    confidence: f32,
    normalizer: TextNormalizer,
}

impl PatternMatcher {
    pub fn new(confidence: f32, normalizer: TextNormalizer) -> VoiceResult<Self> {
        Ok(Self {
            rules: default_rules()?,
            confidence: confidence.clamp(0.0, 1.0),
            normalizer,
        })
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn normalizer(&self) -> &TextNormalizer {
        &self.normalizer
    }

    /// First matching rule, or `None`
    pub fn match_transcript(&self, transcript: &str) -> Option<Intent> {
        let text = self.normalizer.normalize(transcript);
        for rule in &self.rules {
            let Some(caps) = rule.matcher.captures(&text) else {
                continue;
            };
            let entities = (rule.extract)(rule.named_groups(&caps), &self.normalizer);
            debug!("🧩 Pattern '{}' matched '{}'", rule.name, text);
            let raw_response_text = response_template(rule.action, &entities);
            return Some(Intent {
                action: rule.action,
                entities,
                confidence: self.confidence,
                source: IntentSource::OfflinePattern,
                raw_response_text,
            });
        }
        None
    }

    /// Like [`match_transcript`](Self::match_transcript) but never fails
    pub fn resolve(&self, transcript: &str) -> Intent {
        self.match_transcript(transcript)
            .unwrap_or_else(|| Intent::unknown(IntentSource::OfflinePattern))
    }
}
