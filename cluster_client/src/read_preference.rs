use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error_chain_fmt;

/// A set of tags a server must carry, all of them, to match.
pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadMode {
    type Err = SelectionError;

    /// Accepts `primaryPreferred` as well as `primary_preferred`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('_', "").to_lowercase();
        match normalized.as_str() {
            "primary" => Ok(ReadMode::Primary),
            "primarypreferred" => Ok(ReadMode::PrimaryPreferred),
            "secondary" => Ok(ReadMode::Secondary),
            "secondarypreferred" => Ok(ReadMode::SecondaryPreferred),
            "nearest" => Ok(ReadMode::Nearest),
            _ => Err(SelectionError::UnknownReadMode(s.to_string())),
        }
    }
}

/// Which servers an operation may be sent to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadPreference {
    mode: ReadMode,
    tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Vec<TagSet>) -> Result<Self, SelectionError> {
        if mode == ReadMode::Primary && !tag_sets.is_empty() {
            return Err(SelectionError::TagSetsWithPrimary);
        }
        Ok(Self { mode, tag_sets })
    }

    pub fn primary() -> Self {
        Self::from_mode(ReadMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::from_mode(ReadMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::from_mode(ReadMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::from_mode(ReadMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::from_mode(ReadMode::Nearest)
    }

    fn from_mode(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }
}

/// Parses `dc:ny,rack:1` into a tag set. An empty string is the match-all set.
pub fn parse_tag_set(s: &str) -> Result<TagSet, SelectionError> {
    let mut tag_set = TagSet::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| SelectionError::InvalidTag(pair.to_string()))?;
        if key.trim().is_empty() {
            return Err(SelectionError::InvalidTag(pair.to_string()));
        }
        tag_set.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(tag_set)
}

#[derive(thiserror::Error)]
pub enum SelectionError {
    #[error("Unknown read preference mode `{0}`")]
    UnknownReadMode(String),
    #[error("Tag sets can not be combined with the primary read preference")]
    TagSetsWithPrimary,
    #[error("Invalid read preference tag `{0}`, expected `key:value`")]
    InvalidTag(String),
}
impl std::fmt::Debug for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
