//! Core domain types for course and model dumps.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AspectsError, Result};
use crate::keys::{CourseKey, UsageKey};

/// Timestamp layout shared with the warehouse: UTC, microsecond precision.
pub const WAREHOUSE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f+00:00";

/// Well-known block types of the course hierarchy.
pub mod block_types {
    pub const COURSE: &str = "course";
    pub const CHAPTER: &str = "chapter";
    pub const SEQUENTIAL: &str = "sequential";
    pub const VERTICAL: &str = "vertical";

    /// Block types that live outside the navigable hierarchy by default.
    pub const DEFAULT_DETACHED: [&str; 3] = ["about", "course_info", "static_tab"];
}

/// Render a timestamp in the warehouse layout (always six fractional digits).
pub fn format_warehouse_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in the warehouse layout. Any deviation is an error.
pub fn parse_warehouse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, WAREHOUSE_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            AspectsError::parse(format!(
                "timestamp {s:?} does not match {WAREHOUSE_TIMESTAMP_FORMAT:?}: {e}"
            ))
        })
}

// ---------------------------------------------------------------------------
// Course tree
// ---------------------------------------------------------------------------

/// A published content block as returned by the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Block location (may still carry branch/version qualifiers).
    pub location: UsageKey,
    /// Author-facing name, if one was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Only some block types carry a graded flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graded: Option<bool>,
    /// Only some block types carry a completion mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_mode: Option<String>,
    /// Last edit time recorded by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_on: Option<DateTime<Utc>>,
    /// Children in authoring order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// A childless node at `location`.
    pub fn leaf(location: UsageKey) -> Self {
        Self {
            location,
            display_name: None,
            graded: None,
            completion_mode: None,
            edited_on: None,
            children: Vec::new(),
        }
    }

    pub fn block_type(&self) -> &str {
        &self.location.block_type
    }

    /// Copy of this node's own attributes, without children.
    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            location: self.location.clone(),
            display_name: self.display_name.clone(),
            graded: self.graded.unwrap_or(false),
            completion_mode: self.completion_mode.clone().unwrap_or_default(),
            edited_on: self.edited_on,
        }
    }
}

/// Everything the tree fetcher knows about one published course.
#[derive(Debug, Clone)]
pub struct CourseTree {
    /// Root block; children reachable from it are in authoring order.
    pub root: TreeNode,
    /// Every published block in the course, unordered, including detached ones.
    pub all_nodes: Vec<TreeNode>,
}

/// A block's own attributes with optional fields resolved to their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSnapshot {
    pub location: UsageKey,
    pub display_name: Option<String>,
    pub graded: bool,
    pub completion_mode: String,
    pub edited_on: Option<DateTime<Utc>>,
}

impl BlockSnapshot {
    /// Display name, falling back to the block id with underscores as spaces.
    pub fn display_name_with_default(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.location.block_id.replace('_', " "),
        }
    }
}

/// A block annotated with its position in one dump.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedRecord {
    pub block: BlockSnapshot,
    /// Block type is in the configured detached set.
    pub detached: bool,
    /// 1-based position in the dump sequence.
    pub order: u32,
    pub section: u32,
    pub subsection: u32,
    pub unit: u32,
    pub tags: BTreeSet<String>,
}

impl AnnotatedRecord {
    pub fn block_type(&self) -> &str {
        &self.block.location.block_type
    }

    /// Dedupe key: the location without branch/version qualifiers.
    pub fn identity(&self) -> String {
        self.block.location.strip_branch_and_version().to_string()
    }
}

// ---------------------------------------------------------------------------
// Dump runs
// ---------------------------------------------------------------------------

/// Correlates every row written by one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRun {
    pub dump_id: String,
    pub time_last_dumped: DateTime<Utc>,
}

impl DumpRun {
    /// Start a new run now, with a time-sortable id.
    pub fn new() -> Self {
        Self {
            dump_id: Uuid::now_v7().to_string(),
            time_last_dumped: Utc::now(),
        }
    }

    pub fn time_last_dumped_string(&self) -> String {
        format_warehouse_timestamp(&self.time_last_dumped)
    }
}

impl Default for DumpRun {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Course summary & user models
// ---------------------------------------------------------------------------

/// Course-level summary exposed by the host's course overview store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseSummary {
    pub course_key: CourseKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub self_paced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Rewritten on every publish; used as the last-modified time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Store-specific fields passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CourseSummary {
    /// A summary with nothing but the course key.
    pub fn new(course_key: CourseKey) -> Self {
        Self {
            course_key,
            display_name: None,
            start: None,
            end: None,
            enrollment_start: None,
            enrollment_end: None,
            self_paced: false,
            created: None,
            modified: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Last-modified time in warehouse layout, if the store recorded one.
    pub fn last_modified_string(&self) -> Option<String> {
        self.modified.as_ref().map(format_warehouse_timestamp)
    }
}

/// An external id linking a platform user to a third-party identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIdRecord {
    pub id: i64,
    pub external_user_id: String,
    pub external_id_type: String,
    pub user_id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// A retirement request for a platform user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRetirement {
    pub user_id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Warehouse rows
// ---------------------------------------------------------------------------

/// A single positional column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
}

/// One positional row for bulk insert; column order is significant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatRow(pub Vec<FieldValue>);

impl FlatRow {
    pub fn fields(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Error tolerance for one bulk insert batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkInsertOptions {
    /// Rows allowed to fail parsing before the batch is rejected.
    pub max_error_count: u64,
    /// Fraction of rows allowed to fail parsing before the batch is rejected.
    pub max_error_ratio: f64,
}

impl Default for BulkInsertOptions {
    fn default() -> Self {
        Self {
            max_error_count: 1,
            max_error_ratio: 0.1,
        }
    }
}

/// Outcome of an accepted bulk insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertSummary {
    pub table: String,
    pub rows_sent: usize,
    pub written_rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn warehouse_timestamp_roundtrip() {
        let ts = Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap()
            .with_nanosecond(120_000)
            .unwrap();
        let s = format_warehouse_timestamp(&ts);
        assert_eq!(s, "2024-03-09 14:05:07.000120+00:00");
        assert_eq!(parse_warehouse_timestamp(&s).unwrap(), ts);
    }

    #[test]
    fn warehouse_timestamp_rejects_missing_offset() {
        let err = parse_warehouse_timestamp("2024-01-01 00:00:00.000000").unwrap_err();
        assert!(matches!(err, AspectsError::Parse { .. }));
    }

    #[test]
    fn warehouse_timestamp_rejects_iso_layout() {
        assert!(parse_warehouse_timestamp("2024-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn snapshot_applies_defaults() {
        let loc: UsageKey = "block-v1:edX+DemoX+Demo+type@html+block@welcome_text"
            .parse()
            .unwrap();
        let snap = TreeNode::leaf(loc).snapshot();
        assert!(!snap.graded);
        assert_eq!(snap.completion_mode, "");
        assert_eq!(snap.display_name_with_default(), "welcome text");
    }

    #[test]
    fn dump_run_ids_are_unique() {
        let a = DumpRun::new();
        let b = DumpRun::new();
        assert_ne!(a.dump_id, b.dump_id);
        assert!(a.time_last_dumped_string().ends_with("+00:00"));
    }

    #[test]
    fn tree_node_deserializes_nested_children() {
        let json = r#"{
            "location": "block-v1:edX+DemoX+Demo+type@course+block@course",
            "children": [
                {"location": "block-v1:edX+DemoX+Demo+type@chapter+block@c1", "display_name": "Intro"}
            ]
        }"#;
        let node: TreeNode = serde_json::from_str(json).expect("deserialize");
        assert_eq!(node.block_type(), "course");
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].display_name.as_deref(), Some("Intro"));
    }
}
