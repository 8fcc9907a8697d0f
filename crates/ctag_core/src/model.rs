use std::fmt;
use std::ops::AddAssign;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::text::sanitize_text;

pub const UNKNOWN_SPACE: &str = "Unknown";
pub const UNKNOWN_TITLE: &str = "Unknown";

/// One remote page matched by a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRef {
    pub id: Option<String>,
    pub title: String,
    pub space: Option<String>,
}

impl PageRef {
    pub fn display_title(&self) -> String {
        let cleaned = sanitize_text(&self.title);
        if cleaned.trim().is_empty() {
            UNKNOWN_TITLE.to_string()
        } else {
            cleaned
        }
    }

    pub fn space_label(&self) -> &str {
        self.space.as_deref().unwrap_or(UNKNOWN_SPACE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAction {
    Add,
    Remove,
    Replace,
}

impl TagAction {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "replace" => Ok(Self::Replace),
            other => bail!("unsupported action: {other:?} (expected add|remove|replace)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
        }
    }
}

/// Ordered `old -> new` label pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagMapping(Vec<(String, String)>);

impl TagMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, replacing the target of an existing `old` in place.
    pub fn insert(&mut self, old: impl Into<String>, new: impl Into<String>) {
        let old = old.into();
        let new = new.into();
        if let Some(entry) = self.0.iter_mut().find(|(existing, _)| *existing == old) {
            entry.1 = new;
        } else {
            self.0.push((old, new));
        }
    }

    pub fn get(&self, old: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == old)
            .map(|(_, new)| new.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(old, new)| (old.as_str(), new.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn old_tags(&self) -> Vec<&str> {
        self.0.iter().map(|(old, _)| old.as_str()).collect()
    }

    pub fn new_tags(&self) -> Vec<&str> {
        self.0.iter().map(|(_, new)| new.as_str()).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mapping = TagMapping::new();
        for (old, new) in iter {
            mapping.insert(old, new);
        }
        mapping
    }
}

impl<'de> Deserialize<'de> for TagMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = TagMapping;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an object mapping old tag names to new tag names")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<TagMapping, M::Error> {
                let mut mapping = TagMapping::new();
                while let Some((old, new)) = access.next_entry::<String, String>()? {
                    mapping.insert(old, new);
                }
                Ok(mapping)
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

/// A compiled label pattern. Two patterns are equal when their source is.
#[derive(Debug, Clone)]
pub struct TagPattern(Regex);

impl TagPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            bail!("tag patterns must be non-empty");
        }
        Regex::new(pattern)
            .map(Self)
            .with_context(|| format!("invalid regex '{pattern}'"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Unanchored: `v1-` matches `old-v1-doc`.
    pub fn is_match(&self, tag: &str) -> bool {
        self.0.is_match(tag)
    }
}

impl PartialEq for TagPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for TagPattern {}

/// The mutation a command applies; the payload shape follows the action.
///
/// The `*Matching` variants select labels by pattern and are turned into a
/// plain `Remove`/`Replace` per page once its current labels are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOperation {
    Add(Vec<String>),
    Remove(Vec<String>),
    Replace(TagMapping),
    RemoveMatching(Vec<TagPattern>),
    ReplaceMatching(Vec<(TagPattern, String)>),
}

impl TagOperation {
    pub fn action(&self) -> TagAction {
        match self {
            Self::Add(_) => TagAction::Add,
            Self::Remove(_) | Self::RemoveMatching(_) => TagAction::Remove,
            Self::Replace(_) | Self::ReplaceMatching(_) => TagAction::Replace,
        }
    }

    pub fn is_matching(&self) -> bool {
        matches!(self, Self::RemoveMatching(_) | Self::ReplaceMatching(_))
    }

    /// Compile the tags (remove) or the old side of each pair (replace) into
    /// patterns. `add` has nothing to match against.
    pub fn into_matching(self) -> Result<Self> {
        match self {
            Self::Add(_) => bail!("'add' action does not support regex matching"),
            Self::Remove(tags) => tags
                .iter()
                .map(|tag| TagPattern::new(tag))
                .collect::<Result<Vec<_>>>()
                .map(Self::RemoveMatching),
            Self::Replace(mapping) => mapping
                .iter()
                .map(|(old, new)| Ok((TagPattern::new(old)?, new.to_string())))
                .collect::<Result<Vec<_>>>()
                .map(Self::ReplaceMatching),
            matching => Ok(matching),
        }
    }

    /// Nothing to change: an empty tag list or mapping.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Add(tags) | Self::Remove(tags) => tags.is_empty(),
            Self::Replace(mapping) => mapping.is_empty(),
            Self::RemoveMatching(patterns) => patterns.is_empty(),
            Self::ReplaceMatching(pairs) => pairs.is_empty(),
        }
    }

    /// Phrase used in prompts and previews, ending right before the page.
    pub fn describe(&self) -> String {
        match self {
            Self::Add(tags) => format!("Add tags {} to", format_tag_list(tags)),
            Self::Remove(tags) => format!("Remove tags {} from", format_tag_list(tags)),
            Self::Replace(mapping) => format!(
                "Replace tags {} with {} on",
                format_tag_list(&mapping.old_tags()),
                format_tag_list(&mapping.new_tags())
            ),
            Self::RemoveMatching(patterns) => format!(
                "Remove tags matching {} from",
                format_tag_list(&pattern_sources(patterns))
            ),
            Self::ReplaceMatching(pairs) => {
                let (patterns, new_tags): (Vec<&str>, Vec<&str>) = pairs
                    .iter()
                    .map(|(pattern, new)| (pattern.as_str(), new.as_str()))
                    .unzip();
                format!(
                    "Replace tags matching {} with {} on",
                    format_tag_list(&patterns),
                    format_tag_list(&new_tags)
                )
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Add(tags) | Self::Remove(tags) => {
                if tags.is_empty() {
                    bail!(
                        "'{}' action requires at least one tag",
                        self.action().as_str()
                    );
                }
                if tags.iter().any(|tag| tag.trim().is_empty()) {
                    bail!("tag names must be non-empty");
                }
            }
            Self::Replace(mapping) => {
                if mapping.is_empty() {
                    bail!("'replace' action requires at least one old=new pair");
                }
                if mapping
                    .iter()
                    .any(|(old, new)| old.trim().is_empty() || new.trim().is_empty())
                {
                    bail!("old and new tags must be non-empty");
                }
            }
            Self::RemoveMatching(patterns) => {
                if patterns.is_empty() {
                    bail!("'remove' action requires at least one tag pattern");
                }
            }
            Self::ReplaceMatching(pairs) => {
                if pairs.is_empty() {
                    bail!("'replace' action requires at least one pattern/new pair");
                }
                if pairs.iter().any(|(_, new)| new.trim().is_empty()) {
                    bail!("new tags must be non-empty");
                }
            }
        }
        Ok(())
    }
}

/// One requested mutation, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCommand {
    operation: TagOperation,
    cql_expression: String,
    interactive: bool,
    cql_exclude: Option<String>,
}

impl TagCommand {
    pub fn new(
        operation: TagOperation,
        cql_expression: &str,
        interactive: bool,
        cql_exclude: Option<&str>,
    ) -> Result<Self> {
        let cql_expression = cql_expression.trim();
        if cql_expression.is_empty() {
            bail!("cql_expression must be non-empty");
        }
        operation.validate()?;
        Ok(Self {
            operation,
            cql_expression: cql_expression.to_string(),
            interactive,
            cql_exclude: cql_exclude
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
        })
    }

    pub fn action(&self) -> TagAction {
        self.operation.action()
    }

    pub fn operation(&self) -> &TagOperation {
        &self.operation
    }

    pub fn cql_expression(&self) -> &str {
        &self.cql_expression
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn cql_exclude(&self) -> Option<&str> {
        self.cql_exclude.as_deref()
    }

    /// Labels for add/remove; `None` for replace.
    pub fn tags(&self) -> Option<&[String]> {
        match &self.operation {
            TagOperation::Add(tags) | TagOperation::Remove(tags) => Some(tags),
            _ => None,
        }
    }

    /// Mapping for replace; `None` for add/remove.
    pub fn tag_mapping(&self) -> Option<&TagMapping> {
        match &self.operation {
            TagOperation::Replace(mapping) => Some(mapping),
            _ => None,
        }
    }
}

impl fmt::Display for TagCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {:?}",
            self.action().as_str(),
            self.cql_expression
        )?;
        match &self.operation {
            TagOperation::Add(tags) | TagOperation::Remove(tags) => {
                write!(f, ", tags={}", format_tag_list(tags))?
            }
            TagOperation::Replace(mapping) => {
                let pairs = mapping
                    .iter()
                    .map(|(old, new)| format!("{old}={new}"))
                    .collect::<Vec<_>>();
                write!(f, ", tag_mapping={}", format_tag_list(&pairs))?
            }
            TagOperation::RemoveMatching(patterns) => {
                write!(f, ", patterns={}", format_tag_list(&pattern_sources(patterns)))?
            }
            TagOperation::ReplaceMatching(pairs) => {
                let pairs = pairs
                    .iter()
                    .map(|(pattern, new)| format!("{}={new}", pattern.as_str()))
                    .collect::<Vec<_>>();
                write!(f, ", pattern_mapping={}", format_tag_list(&pairs))?
            }
        }
        if let Some(exclude) = &self.cql_exclude {
            write!(f, ", exclude={exclude:?}")?;
        }
        if self.interactive {
            write!(f, ", interactive")?;
        }
        Ok(())
    }
}

/// Outcome counters for one command; summed across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultTally {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub success: usize,
    pub failed: usize,
    pub aborted: bool,
}

impl ResultTally {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }
}

impl AddAssign for ResultTally {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.success += other.success;
        self.failed += other.failed;
        self.aborted |= other.aborted;
    }
}

fn pattern_sources(patterns: &[TagPattern]) -> Vec<&str> {
    patterns.iter().map(TagPattern::as_str).collect()
}

pub fn format_tag_list<S: AsRef<str>>(tags: &[S]) -> String {
    let joined = tags
        .iter()
        .map(|tag| tag.as_ref())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

/// Parse one `old=new` pair, splitting on the first `=`.
pub fn parse_tag_pair(pair: &str) -> Result<(String, String)> {
    let Some((old, new)) = pair.split_once('=') else {
        bail!("invalid tag pair format: '{pair}'. Use format 'oldtag=newtag'");
    };
    let old = old.trim();
    let new = new.trim();
    if old.is_empty() || new.is_empty() {
        bail!("invalid tag pair format: '{pair}'. Old and new tags must be non-empty");
    }
    Ok((old.to_string(), new.to_string()))
}

/// Strict parsing for command-line pairs: any malformed pair is an error.
pub fn parse_tag_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<TagMapping> {
    let mut mapping = TagMapping::new();
    for pair in pairs {
        let (old, new) = parse_tag_pair(pair.as_ref())?;
        mapping.insert(old, new);
    }
    Ok(mapping)
}

/// Command-line pairs for regex replace: `PATTERN NEW [PATTERN NEW ...]`.
pub fn parse_pattern_pairs<S: AsRef<str>>(args: &[S]) -> Result<TagMapping> {
    if args.len() % 2 != 0 {
        bail!(
            "regex replace expects PATTERN NEW pairs, got {} arguments",
            args.len()
        );
    }
    let mut mapping = TagMapping::new();
    for chunk in args.chunks(2) {
        let old = chunk[0].as_ref().trim();
        let new = chunk[1].as_ref().trim();
        if old.is_empty() || new.is_empty() {
            bail!("invalid tag pair: pattern and new tag must be non-empty");
        }
        mapping.insert(old, new);
    }
    Ok(mapping)
}
