//! Row serialization for warehouse bulk inserts.
//!
//! Each row type lists its columns in table order. Column order is the
//! contract with the warehouse schema: change it and the CSV inserts land in
//! the wrong columns.

use serde::Serialize;

use aspects_shared::{
    AnnotatedRecord, CourseSummary, DumpRun, ExternalIdRecord, FieldValue, FlatRow, Result,
    format_warehouse_timestamp,
};

/// Characters that render like an apostrophe; stored as a plain `'`.
const APOSTROPHE_LOOKALIKES: [char; 6] = ['\u{2018}', '\u{2019}', '\u{201B}', '\u{2032}', '`', '\u{00B4}'];

/// Replace apostrophe look-alikes with `'`.
pub fn normalize_apostrophes(s: &str) -> String {
    s.chars()
        .map(|c| if APOSTROPHE_LOOKALIKES.contains(&c) { '\'' } else { c })
        .collect()
}

fn optional_timestamp(ts: Option<&chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(format_warehouse_timestamp).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// course_blocks
// ---------------------------------------------------------------------------

/// Non-key block attributes, stored as one JSON column so the table schema
/// stays fixed.
#[derive(Debug, Serialize)]
struct XBlockData<'a> {
    course: &'a str,
    run: &'a str,
    block_type: &'a str,
    detached: u8,
    graded: u8,
    completion_mode: &'a str,
    section: u32,
    subsection: u32,
    unit: u32,
    tags: Vec<&'a str>,
}

/// One `course_blocks` row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub org: String,
    pub course_key: String,
    /// Location without branch or version.
    pub location: String,
    pub display_name: String,
    pub xblock_data_json: String,
    pub order: u32,
    /// Empty when the store recorded no edit time.
    pub edited_on: String,
    pub dump_id: String,
    pub time_last_dumped: String,
}

/// Serialize one annotated block for `course_blocks`.
pub fn serialize_block(record: &AnnotatedRecord, run: &DumpRun) -> Result<BlockRow> {
    let location = record.block.location.strip_branch_and_version();
    let course_key = &record.block.location.course_key;

    let data = XBlockData {
        course: &course_key.course,
        run: &course_key.run,
        block_type: record.block_type(),
        detached: u8::from(record.detached),
        graded: u8::from(record.block.graded),
        completion_mode: &record.block.completion_mode,
        section: record.section,
        subsection: record.subsection,
        unit: record.unit,
        tags: record.tags.iter().map(String::as_str).collect(),
    };

    Ok(BlockRow {
        org: course_key.org.clone(),
        course_key: course_key.to_string(),
        location: location.to_string(),
        display_name: normalize_apostrophes(&record.block.display_name_with_default()),
        xblock_data_json: serde_json::to_string(&data)?,
        order: record.order,
        edited_on: optional_timestamp(record.block.edited_on.as_ref()),
        dump_id: run.dump_id.clone(),
        time_last_dumped: run.time_last_dumped_string(),
    })
}

/// Serialize a whole flattened course, keeping record order.
pub fn serialize_blocks(records: &[AnnotatedRecord], run: &DumpRun) -> Result<Vec<BlockRow>> {
    records.iter().map(|r| serialize_block(r, run)).collect()
}

impl From<BlockRow> for FlatRow {
    fn from(row: BlockRow) -> Self {
        FlatRow(vec![
            FieldValue::Text(row.org),
            FieldValue::Text(row.course_key),
            FieldValue::Text(row.location),
            FieldValue::Text(row.display_name),
            FieldValue::Text(row.xblock_data_json),
            FieldValue::Int(i64::from(row.order)),
            FieldValue::Text(row.edited_on),
            FieldValue::Text(row.dump_id),
            FieldValue::Text(row.time_last_dumped),
        ])
    }
}

// ---------------------------------------------------------------------------
// course_overviews
// ---------------------------------------------------------------------------

/// One `course_overviews` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseOverviewRow {
    pub org: String,
    pub course_key: String,
    pub display_name: String,
    pub course_start: String,
    pub course_end: String,
    pub enrollment_start: String,
    pub enrollment_end: String,
    pub self_paced: bool,
    /// Store-specific extras as a JSON object.
    pub course_data_json: String,
    pub created: String,
    pub modified: String,
    pub dump_id: String,
    pub time_last_dumped: String,
}

pub fn serialize_course_overview(summary: &CourseSummary, run: &DumpRun) -> Result<CourseOverviewRow> {
    let key = summary.course_key.for_branch_none();
    let display_name = summary
        .display_name
        .clone()
        .unwrap_or_else(|| key.course.replace('_', " "));

    Ok(CourseOverviewRow {
        org: key.org.clone(),
        course_key: key.to_string(),
        display_name: normalize_apostrophes(&display_name),
        course_start: optional_timestamp(summary.start.as_ref()),
        course_end: optional_timestamp(summary.end.as_ref()),
        enrollment_start: optional_timestamp(summary.enrollment_start.as_ref()),
        enrollment_end: optional_timestamp(summary.enrollment_end.as_ref()),
        self_paced: summary.self_paced,
        course_data_json: serde_json::to_string(&summary.extra)?,
        created: optional_timestamp(summary.created.as_ref()),
        modified: optional_timestamp(summary.modified.as_ref()),
        dump_id: run.dump_id.clone(),
        time_last_dumped: run.time_last_dumped_string(),
    })
}

impl From<CourseOverviewRow> for FlatRow {
    fn from(row: CourseOverviewRow) -> Self {
        FlatRow(vec![
            FieldValue::Text(row.org),
            FieldValue::Text(row.course_key),
            FieldValue::Text(row.display_name),
            FieldValue::Text(row.course_start),
            FieldValue::Text(row.course_end),
            FieldValue::Text(row.enrollment_start),
            FieldValue::Text(row.enrollment_end),
            FieldValue::Int(i64::from(row.self_paced)),
            FieldValue::Text(row.course_data_json),
            FieldValue::Text(row.created),
            FieldValue::Text(row.modified),
            FieldValue::Text(row.dump_id),
            FieldValue::Text(row.time_last_dumped),
        ])
    }
}

// ---------------------------------------------------------------------------
// external_id
// ---------------------------------------------------------------------------

/// One `external_id` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalIdRow {
    pub id: i64,
    pub external_user_id: String,
    pub external_id_type: String,
    pub username: String,
    pub user_id: i64,
    pub dump_id: String,
    pub time_last_dumped: String,
}

pub fn serialize_external_id(record: &ExternalIdRecord, run: &DumpRun) -> ExternalIdRow {
    ExternalIdRow {
        id: record.id,
        external_user_id: record.external_user_id.clone(),
        external_id_type: record.external_id_type.clone(),
        username: record.username.clone(),
        user_id: record.user_id,
        dump_id: run.dump_id.clone(),
        time_last_dumped: run.time_last_dumped_string(),
    }
}

impl From<ExternalIdRow> for FlatRow {
    fn from(row: ExternalIdRow) -> Self {
        FlatRow(vec![
            FieldValue::Int(row.id),
            FieldValue::Text(row.external_user_id),
            FieldValue::Text(row.external_id_type),
            FieldValue::Text(row.username),
            FieldValue::Int(row.user_id),
            FieldValue::Text(row.dump_id),
            FieldValue::Text(row.time_last_dumped),
        ])
    }
}
