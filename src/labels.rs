use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OutOfRange;

/// A non-blank identity label.
///
/// Surrounding whitespace is trimmed; case is kept exactly as given, and
/// matches are reported with the stored spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Label {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Label::parse(&value).ok_or_else(|| format!("blank label {value:?}"))
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Labels in insertion order; position `i` names embedding `i` of the
/// identity index.
#[derive(Debug, Clone, Default)]
pub struct LabelStore {
    labels: Vec<Label>,
}

impl LabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, label: Label) -> usize {
        self.labels.push(label);
        self.labels.len() - 1
    }

    pub fn get(&self, position: usize) -> Result<&Label, OutOfRange> {
        self.labels.get(position).ok_or(OutOfRange {
            position,
            len: self.labels.len(),
        })
    }

    pub fn size(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    /// Positions whose label equals `name`, ignoring case.
    pub fn positions_of(&self, name: &str) -> Vec<usize> {
        let name = name.trim().to_lowercase();
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.0.to_lowercase() == name)
            .map(|(i, _)| i)
            .collect()
    }
}

impl FromIterator<Label> for LabelStore {
    fn from_iter<I: IntoIterator<Item = Label>>(iter: I) -> Self {
        Self {
            labels: iter.into_iter().collect(),
        }
    }
}
