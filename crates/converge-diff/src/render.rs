//! Line diff rendering of a [`DiffResult`]
//!
//! Both sides are printed as pretty JSON and compared line by line. An absent side
//! renders as no lines at all, so creations show up as pure additions and
//! deletions as pure removals.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use crate::diff::DiffResult;
use crate::error::Result;

/// Detailed diff content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffContent {
    /// Lines of the diff
    pub lines: Vec<DiffLine>,
}

impl DiffContent {
    /// Render normalized live against predicted live
    pub fn from_result(result: &DiffResult) -> Result<Self> {
        let live = pretty(&result.normalized_live_value()?)?;
        let predicted = pretty(&result.predicted_live_value()?)?;
        Ok(Self::between(&live, &predicted))
    }

    /// Line diff of two texts
    pub fn between(old: &str, new: &str) -> Self {
        let diff = TextDiff::from_lines(old, new);
        let lines = diff
            .iter_all_changes()
            .map(|change| DiffLine {
                line_type: match change.tag() {
                    ChangeTag::Delete => LineType::Removed,
                    ChangeTag::Insert => LineType::Added,
                    ChangeTag::Equal => LineType::Context,
                },
                content: change.value().trim_end().to_string(),
                old_line_no: change.old_index(),
                new_line_no: change.new_index(),
            })
            .collect();

        Self { lines }
    }

    pub fn has_changes(&self) -> bool {
        self.lines
            .iter()
            .any(|line| line.line_type != LineType::Context)
    }

    /// Number of added and removed lines
    pub fn stats(&self) -> (usize, usize) {
        self.lines
            .iter()
            .fold((0, 0), |(added, removed), line| match line.line_type {
                LineType::Added => (added + 1, removed),
                LineType::Removed => (added, removed + 1),
                LineType::Context => (added, removed),
            })
    }

    /// Generate a unified diff string
    pub fn to_unified_diff(&self) -> String {
        let mut output = String::new();

        for line in &self.lines {
            let prefix = match line.line_type {
                LineType::Added => "+",
                LineType::Removed => "-",
                LineType::Context => " ",
            };
            output.push_str(prefix);
            output.push_str(&line.content);
            output.push('\n');
        }

        output
    }
}

/// A single line in a diff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffLine {
    pub line_type: LineType,

    pub content: String,

    /// Line number in the live rendering
    pub old_line_no: Option<usize>,

    /// Line number in the predicted rendering
    pub new_line_no: Option<usize>,
}

/// Type of diff line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    Added,
    Removed,
    Context,
}

fn pretty(value: &Value) -> Result<String> {
    if value.is_null() {
        return Ok(String::new());
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}
