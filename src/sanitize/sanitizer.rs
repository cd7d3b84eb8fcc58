//! Recursive sanitizer
//!
//! Walks a [`Value`] and rebuilds it with sensitive content replaced. Two
//! detection axes apply:
//!
//! - the pattern library, run over every string (and every opaque value's
//!   rendering)
//! - field-name keywords, which force the strategy onto a map entry's string
//!   value whatever it contains
//!
//! Containers currently on the walk path are tracked by identity so a graph
//! that refers back to itself terminates with a `[CIRCULAR]` sentinel.

use super::patterns::{
    compile_patterns, hash_value, is_placeholder, partial_mask, DetectionPattern,
    SensitiveDataType, Strategy, ARRAY, CIRCULAR, NULL, OBJECT, REDACTED, REMOVED, UNDEFINED,
};
use super::value::Value;
use crate::config::{PipelineConfig, SanitizeSettings};
use crate::model::AnalyticsEvent;
use crate::observability::{LogFields, Logger};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

/// Upper bound on replacement passes over one string
const MAX_PASSES: usize = 8;

/// Outcome of one sanitization call
#[derive(Debug, Clone)]
pub struct SanitizeResult<T = Value> {
    pub sanitized_value: T,
    /// Number of replacements made
    pub sanitized_count: usize,
    pub found_types: BTreeSet<SensitiveDataType>,
    pub was_modified: bool,
    pub warnings: Vec<String>,
}

/// Error type for typed-record sanitization
#[derive(Debug, Clone, PartialEq)]
pub enum SanitizeError {
    /// Record could not be converted to its JSON form
    Encode(String),
    /// Sanitized JSON no longer decodes as the record type
    Decode(String),
}

impl std::fmt::Display for SanitizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SanitizeError::Encode(msg) => write!(f, "cannot encode record: {}", msg),
            SanitizeError::Decode(msg) => {
                write!(f, "sanitized record no longer decodes: {}", msg)
            }
        }
    }
}

impl std::error::Error for SanitizeError {}

pub struct Sanitizer {
    settings: SanitizeSettings,
    /// Lowercased keyword and the type it implies
    keywords: Vec<(String, SensitiveDataType)>,
    patterns: Vec<DetectionPattern>,
    pattern_warnings: Vec<String>,
    logger: Logger,
}

impl Sanitizer {
    pub fn new(settings: &SanitizeSettings, keywords: &[String], logger: Logger) -> Self {
        let (patterns, pattern_warnings) = compile_patterns(&settings.custom_patterns);
        for warning in &pattern_warnings {
            logger.warn("compile_patterns", warning, LogFields::new());
        }

        let mut normalized: Vec<(String, SensitiveDataType)> = Vec::new();
        for keyword in keywords {
            let keyword = keyword.trim().to_ascii_lowercase();
            if keyword.is_empty() || normalized.iter().any(|(k, _)| *k == keyword) {
                continue;
            }
            let data_type = SensitiveDataType::for_keyword(&keyword);
            normalized.push((keyword, data_type));
        }

        Sanitizer {
            settings: settings.clone(),
            keywords: normalized,
            patterns,
            pattern_warnings,
            logger,
        }
    }

    pub fn from_config(config: &PipelineConfig, logger: Logger) -> Self {
        Self::new(&config.sanitize, &config.sensitive_keywords, logger)
    }

    /// Warnings raised while compiling the configured patterns
    pub fn pattern_warnings(&self) -> &[String] {
        &self.pattern_warnings
    }

    pub fn sanitize(&self, value: &Value) -> SanitizeResult {
        self.run(value, self.settings.preserve_structure)
    }

    pub fn sanitize_str(&self, s: &str) -> SanitizeResult<String> {
        let result = self.sanitize(&Value::string(s));
        let sanitized = match result.sanitized_value {
            Value::String(s) => s,
            _ => String::new(),
        };
        SanitizeResult {
            sanitized_value: sanitized,
            sanitized_count: result.sanitized_count,
            found_types: result.found_types,
            was_modified: result.was_modified,
            warnings: result.warnings,
        }
    }

    /// Sanitize an event through its JSON form, keeping every field in place.
    ///
    /// Durations that JSON cannot carry are reset to 0 first, with a warning,
    /// so a malformed measurement does not cost the whole event.
    pub fn sanitize_event(
        &self,
        event: &AnalyticsEvent,
    ) -> Result<SanitizeResult<AnalyticsEvent>, SanitizeError> {
        let mut event = event.clone();
        let reset = event.zero_invalid_durations();

        let json =
            serde_json::to_value(&event).map_err(|e| SanitizeError::Encode(e.to_string()))?;
        let mut result = self.run(&Value::from(json), true);
        let sanitized: AnalyticsEvent = serde_json::from_value(result.sanitized_value.to_json())
            .map_err(|e| SanitizeError::Decode(e.to_string()))?;

        if reset > 0 {
            result
                .warnings
                .push(format!("{} invalid duration(s) recorded as 0", reset));
        }
        Ok(SanitizeResult {
            sanitized_value: sanitized,
            sanitized_count: result.sanitized_count,
            found_types: result.found_types,
            was_modified: result.was_modified || reset > 0,
            warnings: result.warnings,
        })
    }

    /// Detection only; no replacement
    pub fn contains_sensitive_data(&self, s: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(s))
    }

    /// Types detected in `s`
    pub fn detect(&self, s: &str) -> BTreeSet<SensitiveDataType> {
        self.patterns
            .iter()
            .filter(|p| p.regex.is_match(s))
            .map(|p| p.data_type)
            .collect()
    }

    pub fn strategy_for(&self, data_type: SensitiveDataType) -> Strategy {
        self.settings
            .strategy_overrides
            .get(&data_type)
            .copied()
            .unwrap_or(self.settings.default_strategy)
    }

    fn keyword_type(&self, field: &str) -> Option<SensitiveDataType> {
        let field = field.to_ascii_lowercase();
        self.keywords
            .iter()
            .find(|(keyword, _)| field.contains(keyword.as_str()))
            .map(|(_, data_type)| *data_type)
    }

    fn render(&self, strategy: Strategy, matched: &str, preserve_structure: bool) -> String {
        match strategy {
            Strategy::Redact => REDACTED.to_string(),
            Strategy::Remove if preserve_structure => REMOVED.to_string(),
            Strategy::Remove => String::new(),
            Strategy::Partial => partial_mask(
                matched,
                self.settings.partial_mask_length,
                self.settings.mask_char,
            ),
            Strategy::Hash => hash_value(matched, &self.settings.hash_salt),
        }
    }

    fn run(&self, value: &Value, preserve_structure: bool) -> SanitizeResult {
        let started = Instant::now();
        let mut walk = Walk {
            sanitizer: self,
            preserve_structure,
            visiting: HashSet::new(),
            count: 0,
            found: BTreeSet::new(),
            warnings: Vec::new(),
        };

        let sanitized = match walk.value(value, 0) {
            Outcome::Keep(v) => v,
            Outcome::Drop => Value::string(""),
        };

        let mut warnings = self.pattern_warnings.clone();
        warnings.append(&mut walk.warnings);

        let types: Vec<String> = walk
            .found
            .iter()
            .map(|t| format!("{:?}", t))
            .collect();
        let fields = LogFields::new()
            .with("count", walk.count)
            .with("types", types.join(","))
            .with("elapsed_us", started.elapsed().as_micros());
        if walk.count > 0 {
            self.logger.info("sanitize", "sensitive data replaced", fields);
        } else {
            self.logger.debug("sanitize", "nothing to replace", fields);
        }

        SanitizeResult {
            sanitized_value: sanitized,
            sanitized_count: walk.count,
            found_types: walk.found,
            was_modified: walk.count > 0,
            warnings,
        }
    }
}

enum Outcome {
    Keep(Value),
    /// Entry is removed from its parent container
    Drop,
}

/// State for one sanitization call
struct Walk<'a> {
    sanitizer: &'a Sanitizer,
    preserve_structure: bool,
    /// Containers on the current path
    visiting: HashSet<usize>,
    count: usize,
    found: BTreeSet<SensitiveDataType>,
    warnings: Vec<String>,
}

impl<'a> Walk<'a> {
    fn value(&mut self, value: &Value, depth: usize) -> Outcome {
        match value {
            Value::Null => Outcome::Keep(Value::string(NULL)),
            Value::Undefined => Outcome::Keep(Value::string(UNDEFINED)),
            Value::Bool(_) | Value::Number(_) => Outcome::Keep(value.clone()),
            Value::String(s) => self.text(s),
            Value::Opaque { repr, .. } => self.text(repr),
            Value::List(list) => {
                let Some(id) = value.container_id() else {
                    return Outcome::Keep(Value::string(ARRAY));
                };
                if self.visiting.contains(&id) {
                    return self.circular();
                }
                if depth > 0 && !self.preserve_structure {
                    self.count += 1;
                    return Outcome::Keep(Value::string(ARRAY));
                }

                self.visiting.insert(id);
                let items: Vec<Value> = list.read().clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    match self.value(item, depth + 1) {
                        Outcome::Keep(v) => out.push(v),
                        Outcome::Drop => self.count += 1,
                    }
                }
                self.visiting.remove(&id);
                Outcome::Keep(Value::list(out))
            }
            Value::Map(map) => {
                let Some(id) = value.container_id() else {
                    return Outcome::Keep(Value::string(OBJECT));
                };
                if self.visiting.contains(&id) {
                    return self.circular();
                }
                if depth > 0 && !self.preserve_structure {
                    self.count += 1;
                    return Outcome::Keep(Value::string(OBJECT));
                }

                self.visiting.insert(id);
                let entries: Vec<(String, Value)> = map
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut out = BTreeMap::new();
                for (key, child) in entries {
                    let outcome = match (&child, self.sanitizer.keyword_type(&key)) {
                        (Value::String(s), Some(data_type)) => self.forced(s, data_type),
                        _ => self.value(&child, depth + 1),
                    };
                    match outcome {
                        Outcome::Keep(v) => {
                            out.insert(key, v);
                        }
                        Outcome::Drop => self.count += 1,
                    }
                }
                self.visiting.remove(&id);
                Outcome::Keep(Value::map(out))
            }
        }
    }

    fn circular(&mut self) -> Outcome {
        self.count += 1;
        if !self.warnings.iter().any(|w| w.starts_with("circular")) {
            self.warnings
                .push("circular reference replaced with sentinel".to_string());
        }
        Outcome::Keep(Value::string(CIRCULAR))
    }

    /// Apply the strategy to a whole field value named by a sensitive keyword.
    fn forced(&mut self, s: &str, data_type: SensitiveDataType) -> Outcome {
        if is_placeholder(s) {
            return Outcome::Keep(Value::string(s));
        }
        let sanitizer = self.sanitizer;
        self.found.insert(data_type);

        let strategy = sanitizer.strategy_for(data_type);
        if strategy == Strategy::Remove && !self.preserve_structure {
            return Outcome::Drop;
        }
        let rendered = sanitizer.render(strategy, s, self.preserve_structure);
        if rendered != s {
            self.count += 1;
        }
        // Partial masking keeps characters; scan what is left
        self.text(&rendered)
    }

    fn text(&mut self, s: &str) -> Outcome {
        if is_placeholder(s) {
            return Outcome::Keep(Value::string(s));
        }
        let sanitizer = self.sanitizer;
        let mut current = s.to_string();
        let mut removed = false;

        for _ in 0..MAX_PASSES {
            let mut matched = false;
            for pattern in &sanitizer.patterns {
                if !pattern.regex.is_match(&current) {
                    continue;
                }
                matched = true;
                self.found.insert(pattern.data_type);

                let strategy = sanitizer.strategy_for(pattern.data_type);
                removed |= strategy == Strategy::Remove;
                let preserve = self.preserve_structure;
                let mut hits = 0;
                let replaced = pattern
                    .regex
                    .replace_all(&current, |caps: &regex::Captures<'_>| {
                        hits += 1;
                        sanitizer.render(strategy, &caps[0], preserve)
                    })
                    .into_owned();
                self.count += hits;
                current = replaced;
            }
            if !matched {
                break;
            }
        }

        if sanitizer.contains_sensitive_data(&current) {
            self.count += 1;
            self.warnings.push(
                "replacement did not converge; whole value redacted".to_string(),
            );
            current = if sanitizer.contains_sensitive_data(REDACTED) {
                String::new()
            } else {
                REDACTED.to_string()
            };
        }

        if removed && !self.preserve_structure && current.trim().is_empty() && !s.trim().is_empty()
        {
            return Outcome::Drop;
        }
        Outcome::Keep(Value::String(current))
    }
}
