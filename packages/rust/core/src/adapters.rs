//! Seams to the systems around the sinks.
//!
//! The engine and pipeline only see these traits. `aspects-storage` and
//! `aspects-warehouse` provide the production implementations and
//! [`crate::memory`] provides in-process ones for tests and dry runs.

use std::collections::BTreeSet;

use async_trait::async_trait;

use aspects_shared::{
    BulkInsertOptions, CourseKey, CourseSummary, CourseTree, ExternalIdRecord, FlatRow,
    InsertSummary, Result, UsageKey, UserRetirement,
};

/// Supplies the published course tree.
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    /// Root of the published tree plus every published block, detached ones included.
    ///
    /// Fails with `NotFound` for an unknown course.
    async fn get_tree(&self, course_key: &CourseKey) -> Result<CourseTree>;
}

/// Supplies taxonomy tags for a block.
///
/// Infallible: implementations degrade to an empty set on unknown ids or
/// backend trouble.
#[async_trait]
pub trait TagLookup: Send + Sync {
    async fn get_tags(&self, location: &UsageKey) -> BTreeSet<String>;
}

/// Course-level summaries kept by the host.
#[async_trait]
pub trait CourseSummaryStore: Send + Sync {
    async fn get_course_summary(&self, course_key: &CourseKey) -> Result<Option<CourseSummary>>;

    /// Every course the store knows, in a stable order.
    async fn list_course_keys(&self) -> Result<Vec<CourseKey>>;
}

/// User models dumped by the single-row sinks.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn get_external_id(&self, id: i64) -> Result<Option<ExternalIdRecord>>;

    async fn get_user_retirement(&self, user_id: i64) -> Result<Option<UserRetirement>>;
}

/// The analytics warehouse.
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Insert `rows` positionally into `table`.
    ///
    /// Rows the warehouse cannot parse are dropped up to the limits in
    /// `options`; past them the whole batch fails with `BulkInsert`.
    async fn bulk_insert(
        &self,
        table: &str,
        rows: &[FlatRow],
        options: &BulkInsertOptions,
    ) -> Result<InsertSummary>;

    /// Most recent `time_last_dumped` for the row whose `key_column` equals `key`.
    async fn last_dumped_timestamp(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<Option<String>>;

    /// Delete every row of `table` whose `column` equals `value`.
    async fn delete_rows(&self, table: &str, column: &str, value: &str) -> Result<()>;
}
