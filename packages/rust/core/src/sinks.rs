//! Model sinks: one per warehouse-facing model.
//!
//! A sink turns an object id into warehouse writes. Course dumps write the
//! overview row first and then every block of the course; the user sinks
//! write or purge a single user's rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use aspects_shared::{
    AspectsError, CourseKey, DumpRun, FlatRow, InsertSummary, Result, SinkSettings,
    config::sink_names,
};

use crate::adapters::{CourseSummaryStore, ModelStore, TagLookup, TreeFetcher, WarehouseSink};
use crate::flatten::FlattenEngine;
use crate::serializer;

/// Warehouse table names.
pub mod tables {
    pub const COURSE_OVERVIEWS: &str = "course_overviews";
    pub const COURSE_BLOCKS: &str = "course_blocks";
    pub const EXTERNAL_ID: &str = "external_id";
}

/// Everything a sink reads from or writes to, shared by all sinks of a process.
#[derive(Clone)]
pub struct SinkContext {
    pub trees: Arc<dyn TreeFetcher>,
    pub tags: Arc<dyn TagLookup>,
    pub summaries: Arc<dyn CourseSummaryStore>,
    pub models: Arc<dyn ModelStore>,
    pub warehouse: Arc<dyn WarehouseSink>,
    pub settings: Arc<SinkSettings>,
}

impl SinkContext {
    /// Build a context where one store serves every content-side adapter.
    pub fn new<S>(store: Arc<S>, warehouse: Arc<dyn WarehouseSink>, settings: SinkSettings) -> Self
    where
        S: TreeFetcher + TagLookup + CourseSummaryStore + ModelStore + 'static,
    {
        Self {
            trees: store.clone(),
            tags: store.clone(),
            summaries: store.clone(),
            models: store,
            warehouse,
            settings: Arc::new(settings),
        }
    }

    async fn insert(&self, table: &str, rows: Vec<FlatRow>) -> Result<InsertSummary> {
        let summary = self
            .warehouse
            .bulk_insert(table, &rows, &self.settings.bulk_insert)
            .await?;
        if summary.written_rows < summary.rows_sent as u64 {
            warn!(
                table,
                sent = summary.rows_sent,
                written = summary.written_rows,
                "warehouse dropped rows within the error threshold"
            );
        }
        Ok(summary)
    }
}

/// What one sink run wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReport {
    pub inserted: Vec<InsertSummary>,
    /// Tables a user's rows were deleted from.
    pub purged_tables: Vec<String>,
}

impl SinkReport {
    /// Rows the warehouse accepted for `table`.
    pub fn written_to(&self, table: &str) -> u64 {
        self.inserted
            .iter()
            .filter(|s| s.table == table)
            .map(|s| s.written_rows)
            .sum()
    }
}

/// A sink for one warehouse-facing model.
#[async_trait]
pub trait ModelSink: Send + Sync {
    /// Name used in config (`[sinks] enabled`) and task routing.
    fn name(&self) -> &'static str;

    /// Primary warehouse table.
    fn table(&self) -> &'static str;

    /// Column identifying one object in `table`.
    fn unique_key(&self) -> &'static str;

    /// Dump the object identified by `object_id` as part of `run`.
    async fn dump(&self, object_id: &str, run: &DumpRun) -> Result<SinkReport>;
}

fn parse_numeric_id(sink: &str, object_id: &str) -> Result<i64> {
    object_id
        .trim()
        .parse()
        .map_err(|_| AspectsError::parse(format!("{sink}: object id {object_id:?} is not numeric")))
}

// ---------------------------------------------------------------------------
// Course overviews (+ nested course blocks)
// ---------------------------------------------------------------------------

/// Dumps a course overview row and then the course's flattened blocks.
pub struct CourseOverviewSink {
    ctx: SinkContext,
}

impl CourseOverviewSink {
    pub fn new(ctx: SinkContext) -> Self {
        Self { ctx }
    }

    /// `modified` of the course summary in warehouse layout, if any.
    pub async fn last_modified(&self, course_key: &CourseKey) -> Result<Option<String>> {
        Ok(self
            .ctx
            .summaries
            .get_course_summary(course_key)
            .await?
            .and_then(|s| s.last_modified_string()))
    }

    /// `time_last_dumped` of the course, if it was ever dumped.
    ///
    /// Read from `course_overviews`, or from `course_blocks` when overviews
    /// are disabled. With both disabled nothing records a dump.
    pub async fn last_dumped(&self, course_key: &CourseKey) -> Result<Option<String>> {
        let settings = &self.ctx.settings;
        let table = if settings.is_enabled(sink_names::COURSE_OVERVIEWS) {
            tables::COURSE_OVERVIEWS
        } else if settings.is_enabled(sink_names::COURSE_BLOCKS) {
            tables::COURSE_BLOCKS
        } else {
            warn!(course_key = %course_key, "course sinks disabled, no dump time to compare");
            return Ok(None);
        };
        self.ctx
            .warehouse
            .last_dumped_timestamp(
                table,
                self.unique_key(),
                &course_key.for_branch_none().to_string(),
            )
            .await
    }

    #[instrument(skip_all, fields(course_key = %course_key, dump_id = %run.dump_id))]
    pub async fn dump_course(&self, course_key: &CourseKey, run: &DumpRun) -> Result<SinkReport> {
        let settings = &self.ctx.settings;
        let overviews = settings.is_enabled(sink_names::COURSE_OVERVIEWS);
        let blocks = settings.is_enabled(sink_names::COURSE_BLOCKS);

        // Read everything before the first write so an unknown course leaves
        // the warehouse untouched.
        let overview_row = if overviews {
            let summary = self
                .ctx
                .summaries
                .get_course_summary(course_key)
                .await?
                .ok_or_else(|| AspectsError::not_found(format!("course overview {course_key}")))?;
            Some(FlatRow::from(serializer::serialize_course_overview(&summary, run)?))
        } else {
            debug!("course_overviews sink disabled");
            None
        };

        let block_rows = if blocks {
            let tree = self.ctx.trees.get_tree(course_key).await?;
            let tags = settings.tags_enabled.then_some(self.ctx.tags.as_ref());
            let engine = FlattenEngine::new(settings.detached_block_types.clone(), tags);
            let records = engine.flatten(&tree).await;
            let rows: Vec<FlatRow> = serializer::serialize_blocks(&records, run)?
                .into_iter()
                .map(FlatRow::from)
                .collect();
            Some(rows)
        } else {
            debug!("course_blocks sink disabled");
            None
        };

        let mut report = SinkReport::default();
        if let Some(row) = overview_row {
            report
                .inserted
                .push(self.ctx.insert(tables::COURSE_OVERVIEWS, vec![row]).await?);
        }
        if let Some(rows) = block_rows {
            report
                .inserted
                .push(self.ctx.insert(tables::COURSE_BLOCKS, rows).await?);
        }

        info!(
            overview_rows = report.written_to(tables::COURSE_OVERVIEWS),
            block_rows = report.written_to(tables::COURSE_BLOCKS),
            "course dumped"
        );
        Ok(report)
    }
}

#[async_trait]
impl ModelSink for CourseOverviewSink {
    fn name(&self) -> &'static str {
        sink_names::COURSE_OVERVIEWS
    }

    fn table(&self) -> &'static str {
        tables::COURSE_OVERVIEWS
    }

    fn unique_key(&self) -> &'static str {
        "course_key"
    }

    async fn dump(&self, object_id: &str, run: &DumpRun) -> Result<SinkReport> {
        let course_key: CourseKey = object_id.parse()?;
        self.dump_course(&course_key, run).await
    }
}

// ---------------------------------------------------------------------------
// External ids
// ---------------------------------------------------------------------------

/// Dumps one external id row.
pub struct ExternalIdSink {
    ctx: SinkContext,
}

impl ExternalIdSink {
    pub fn new(ctx: SinkContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ModelSink for ExternalIdSink {
    fn name(&self) -> &'static str {
        sink_names::EXTERNAL_ID
    }

    fn table(&self) -> &'static str {
        tables::EXTERNAL_ID
    }

    fn unique_key(&self) -> &'static str {
        "id"
    }

    #[instrument(skip_all, fields(sink = "external_id", object_id = %object_id))]
    async fn dump(&self, object_id: &str, run: &DumpRun) -> Result<SinkReport> {
        if !self.ctx.settings.is_enabled(self.name()) {
            debug!("sink disabled");
            return Ok(SinkReport::default());
        }
        let id = parse_numeric_id(self.name(), object_id)?;
        let record = self
            .ctx
            .models
            .get_external_id(id)
            .await?
            .ok_or_else(|| AspectsError::not_found(format!("external id {id}")))?;

        let row = serializer::serialize_external_id(&record, run);
        let summary = self.ctx.insert(self.table(), vec![row.into()]).await?;
        info!(id, user_id = record.user_id, "external id dumped");
        Ok(SinkReport {
            inserted: vec![summary],
            purged_tables: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// User retirement
// ---------------------------------------------------------------------------

/// Deletes a retired user's rows from every configured PII table.
pub struct UserRetirementSink {
    ctx: SinkContext,
}

impl UserRetirementSink {
    pub fn new(ctx: SinkContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ModelSink for UserRetirementSink {
    fn name(&self) -> &'static str {
        sink_names::USER_RETIREMENT
    }

    fn table(&self) -> &'static str {
        "user_profile"
    }

    fn unique_key(&self) -> &'static str {
        "user_id"
    }

    #[instrument(skip_all, fields(sink = "user_retirement", object_id = %object_id))]
    async fn dump(&self, object_id: &str, _run: &DumpRun) -> Result<SinkReport> {
        if !self.ctx.settings.is_enabled(self.name()) {
            debug!("sink disabled");
            return Ok(SinkReport::default());
        }
        let user_id = parse_numeric_id(self.name(), object_id)?;
        let retirement = self
            .ctx
            .models
            .get_user_retirement(user_id)
            .await?
            .ok_or_else(|| AspectsError::not_found(format!("retirement for user {user_id}")))?;

        let mut report = SinkReport::default();
        let value = user_id.to_string();
        for table in &self.ctx.settings.pii_tables {
            self.ctx
                .warehouse
                .delete_rows(table, self.unique_key(), &value)
                .await?;
            report.purged_tables.push(table.clone());
        }
        info!(
            user_id,
            username = %retirement.username,
            tables = report.purged_tables.len(),
            "retired user purged"
        );
        Ok(report)
    }
}

/// Every sink, by name.
pub fn registry(ctx: &SinkContext) -> BTreeMap<&'static str, Arc<dyn ModelSink>> {
    let sinks: Vec<Arc<dyn ModelSink>> = vec![
        Arc::new(CourseOverviewSink::new(ctx.clone())),
        Arc::new(ExternalIdSink::new(ctx.clone())),
        Arc::new(UserRetirementSink::new(ctx.clone())),
    ];
    sinks.into_iter().map(|s| (s.name(), s)).collect()
}
