//! In-process adapters.
//!
//! [`InMemoryContentStore`] serves fixed content; [`RecordingWarehouse`]
//! keeps every write instead of sending it anywhere. The CLI uses the
//! latter for `--dry-run`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use aspects_shared::{
    AspectsError, BulkInsertOptions, CourseKey, CourseSummary, CourseTree, ExternalIdRecord,
    FlatRow, InsertSummary, Result, UsageKey, UserRetirement,
};

use crate::adapters::{CourseSummaryStore, ModelStore, TagLookup, TreeFetcher, WarehouseSink};

/// Content store backed by maps filled at construction.
#[derive(Debug, Default, Clone)]
pub struct InMemoryContentStore {
    trees: BTreeMap<CourseKey, CourseTree>,
    summaries: BTreeMap<CourseKey, CourseSummary>,
    tags: HashMap<String, BTreeSet<String>>,
    external_ids: HashMap<i64, ExternalIdRecord>,
    retirements: HashMap<i64, UserRetirement>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a published course. The summary's key is used for lookups.
    pub fn with_course(mut self, summary: CourseSummary, tree: CourseTree) -> Self {
        let key = summary.course_key.for_branch_none();
        self.trees.insert(key.clone(), tree);
        self.summaries.insert(key, summary);
        self
    }

    /// Add a summary without a tree (a course the content store lost).
    pub fn with_summary(mut self, summary: CourseSummary) -> Self {
        self.summaries
            .insert(summary.course_key.for_branch_none(), summary);
        self
    }

    pub fn with_tags<I, S>(mut self, location: &UsageKey, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.insert(
            location.strip_branch_and_version().to_string(),
            tags.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_external_id(mut self, record: ExternalIdRecord) -> Self {
        self.external_ids.insert(record.id, record);
        self
    }

    pub fn with_retirement(mut self, retirement: UserRetirement) -> Self {
        self.retirements.insert(retirement.user_id, retirement);
        self
    }
}

#[async_trait]
impl TreeFetcher for InMemoryContentStore {
    async fn get_tree(&self, course_key: &CourseKey) -> Result<CourseTree> {
        self.trees
            .get(&course_key.for_branch_none())
            .cloned()
            .ok_or_else(|| AspectsError::not_found(format!("course {course_key}")))
    }
}

#[async_trait]
impl TagLookup for InMemoryContentStore {
    async fn get_tags(&self, location: &UsageKey) -> BTreeSet<String> {
        self.tags
            .get(&location.strip_branch_and_version().to_string())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CourseSummaryStore for InMemoryContentStore {
    async fn get_course_summary(&self, course_key: &CourseKey) -> Result<Option<CourseSummary>> {
        Ok(self.summaries.get(&course_key.for_branch_none()).cloned())
    }

    async fn list_course_keys(&self) -> Result<Vec<CourseKey>> {
        Ok(self.summaries.keys().cloned().collect())
    }
}

#[async_trait]
impl ModelStore for InMemoryContentStore {
    async fn get_external_id(&self, id: i64) -> Result<Option<ExternalIdRecord>> {
        Ok(self.external_ids.get(&id).cloned())
    }

    async fn get_user_retirement(&self, user_id: i64) -> Result<Option<UserRetirement>> {
        Ok(self.retirements.get(&user_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// RecordingWarehouse
// ---------------------------------------------------------------------------

/// One accepted `bulk_insert` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInsert {
    pub table: String,
    pub rows: Vec<FlatRow>,
}

/// One `delete_rows` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelete {
    pub table: String,
    pub column: String,
    pub value: String,
}

/// Warehouse that records writes in memory.
#[derive(Debug, Default)]
pub struct RecordingWarehouse {
    inserts: RwLock<Vec<RecordedInsert>>,
    deletes: RwLock<Vec<RecordedDelete>>,
    last_dumped: RwLock<HashMap<(String, String), String>>,
    failing_tables: HashSet<String>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts into `table` fail with `BulkInsert` and nothing is recorded.
    pub fn failing_on(mut self, table: impl Into<String>) -> Self {
        self.failing_tables.insert(table.into());
        self
    }

    /// Seed the answer `last_dumped_timestamp` gives for `key` in `table`.
    pub async fn set_last_dumped(&self, table: &str, key: &str, timestamp: impl Into<String>) {
        self.last_dumped
            .write()
            .await
            .insert((table.to_string(), key.to_string()), timestamp.into());
    }

    pub async fn inserts(&self) -> Vec<RecordedInsert> {
        self.inserts.read().await.clone()
    }

    pub async fn deletes(&self) -> Vec<RecordedDelete> {
        self.deletes.read().await.clone()
    }

    /// Every row inserted into `table`, across calls.
    pub async fn rows_for(&self, table: &str) -> Vec<FlatRow> {
        self.inserts
            .read()
            .await
            .iter()
            .filter(|i| i.table == table)
            .flat_map(|i| i.rows.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl WarehouseSink for RecordingWarehouse {
    async fn bulk_insert(
        &self,
        table: &str,
        rows: &[FlatRow],
        _options: &BulkInsertOptions,
    ) -> Result<InsertSummary> {
        if self.failing_tables.contains(table) {
            return Err(AspectsError::BulkInsert {
                table: table.to_string(),
                written_rows: 0,
                message: "rejected by recording warehouse".into(),
            });
        }
        self.inserts.write().await.push(RecordedInsert {
            table: table.to_string(),
            rows: rows.to_vec(),
        });
        Ok(InsertSummary {
            table: table.to_string(),
            rows_sent: rows.len(),
            written_rows: rows.len() as u64,
        })
    }

    async fn last_dumped_timestamp(
        &self,
        table: &str,
        _key_column: &str,
        key: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .last_dumped
            .read()
            .await
            .get(&(table.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete_rows(&self, table: &str, column: &str, value: &str) -> Result<()> {
        self.deletes.write().await.push(RecordedDelete {
            table: table.to_string(),
            column: column.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspects_shared::{FieldValue, TreeNode};

    fn key() -> CourseKey {
        CourseKey::new("edX", "DemoX", "Demo")
    }

    #[tokio::test]
    async fn unknown_course_is_not_found() {
        let store = InMemoryContentStore::new();
        let err = store.get_tree(&key()).await.unwrap_err();
        assert!(matches!(err, AspectsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn lookups_ignore_branch_qualifiers() {
        let root = TreeNode::leaf(key().root_location());
        let tree = CourseTree {
            root: root.clone(),
            all_nodes: vec![root],
        };
        let loc = UsageKey::new(key(), "html", "h1");
        let store = InMemoryContentStore::new()
            .with_course(CourseSummary::new(key()), tree)
            .with_tags(&loc, ["topic:intro"]);

        let mut qualified = key();
        qualified.branch = Some("published-branch".into());
        assert!(store.get_tree(&qualified).await.is_ok());

        let qualified_loc = UsageKey::new(qualified, "html", "h1");
        assert_eq!(store.get_tags(&qualified_loc).await.len(), 1);
        assert!(store.get_tags(&key().root_location()).await.is_empty());
    }

    #[tokio::test]
    async fn recording_warehouse_records_and_fails_on_demand() {
        let wh = RecordingWarehouse::new().failing_on("course_blocks");
        let rows = vec![FlatRow(vec![FieldValue::Int(1)])];
        let opts = BulkInsertOptions::default();

        let summary = wh.bulk_insert("course_overviews", &rows, &opts).await.unwrap();
        assert_eq!(summary.written_rows, 1);
        assert!(wh.bulk_insert("course_blocks", &rows, &opts).await.is_err());
        assert_eq!(wh.rows_for("course_overviews").await.len(), 1);
        assert!(wh.rows_for("course_blocks").await.is_empty());

        wh.set_last_dumped("course_overviews", "k", "2024-01-01 00:00:00.000000+00:00")
            .await;
        let ts = wh
            .last_dumped_timestamp("course_overviews", "course_key", "k")
            .await
            .unwrap();
        assert!(ts.is_some());
    }
}
