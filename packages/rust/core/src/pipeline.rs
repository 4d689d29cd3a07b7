//! Course dump pipeline: staleness gate → course overview → course blocks.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use aspects_shared::{CourseKey, DumpRun, Result};

use crate::sinks::{CourseOverviewSink, SinkContext, tables};
use crate::staleness::{self, DumpDecision};

/// Outcome of one `dump_course` call.
#[derive(Debug, Clone)]
pub struct DumpCourseResult {
    pub course_key: CourseKey,
    pub decision: DumpDecision,
    /// Set only when the course was dumped.
    pub dump_id: Option<String>,
    pub overview_rows: u64,
    pub block_rows: u64,
    pub elapsed: Duration,
}

impl DumpCourseResult {
    pub fn dumped(&self) -> bool {
        self.dump_id.is_some()
    }
}

/// Filters for a bulk dump of every known course.
#[derive(Debug, Clone, Default)]
pub struct DumpCoursesOptions {
    /// Only these courses, when non-empty.
    pub ids: Vec<CourseKey>,
    /// Never these courses.
    pub skip_ids: Vec<CourseKey>,
    /// Dump regardless of staleness.
    pub force: bool,
    /// Stop after this many courses have been dumped.
    pub limit: Option<usize>,
}

/// Outcome of a bulk dump.
#[derive(Debug, Clone, Default)]
pub struct DumpCoursesSummary {
    pub dumped: Vec<DumpCourseResult>,
    pub skipped: Vec<DumpCourseResult>,
    /// Courses whose check or dump failed, with the error text.
    pub failed: Vec<(CourseKey, String)>,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each course has been handled, dumped or not.
    fn course_done(&self, result: &DumpCourseResult, current: usize, total: usize);
    /// Called when a course fails.
    fn course_failed(&self, course_key: &CourseKey, error: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn course_done(&self, _result: &DumpCourseResult, _current: usize, _total: usize) {}
    fn course_failed(&self, _course_key: &CourseKey, _error: &str) {}
}

/// Decide whether `course_key` needs a dump.
pub async fn check_course(ctx: &SinkContext, course_key: &CourseKey) -> Result<DumpDecision> {
    let sink = CourseOverviewSink::new(ctx.clone());
    let last_dumped = sink.last_dumped(course_key).await?;
    // Only consult the summary when the warehouse has seen the course.
    let last_modified = match last_dumped {
        Some(_) => sink.last_modified(course_key).await?,
        None => None,
    };
    staleness::should_dump(last_dumped.as_deref(), last_modified.as_deref())
}

/// Dump one course if it is stale (or `force` is set).
///
/// 1. Staleness check against the last overview dump
/// 2. Course overview row
/// 3. Flattened course blocks
#[instrument(skip_all, fields(course_key = %course_key, force = force))]
pub async fn dump_course(
    ctx: &SinkContext,
    course_key: &CourseKey,
    force: bool,
) -> Result<DumpCourseResult> {
    let start = Instant::now();

    let decision = if force {
        DumpDecision::forced()
    } else {
        check_course(ctx, course_key).await?
    };

    if !decision.should_dump {
        info!(reason = %decision.reason, "course skipped");
        return Ok(DumpCourseResult {
            course_key: course_key.clone(),
            decision,
            dump_id: None,
            overview_rows: 0,
            block_rows: 0,
            elapsed: start.elapsed(),
        });
    }

    let run = DumpRun::new();
    info!(dump_id = %run.dump_id, reason = %decision.reason, "dumping course");
    let report = CourseOverviewSink::new(ctx.clone())
        .dump_course(course_key, &run)
        .await?;

    let result = DumpCourseResult {
        course_key: course_key.clone(),
        decision,
        dump_id: Some(run.dump_id),
        overview_rows: report.written_to(tables::COURSE_OVERVIEWS),
        block_rows: report.written_to(tables::COURSE_BLOCKS),
        elapsed: start.elapsed(),
    };
    info!(
        block_rows = result.block_rows,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "course dump complete"
    );
    Ok(result)
}

/// Dump every known course that passes the filters and the staleness check.
///
/// A failing course is recorded and the run moves on; nothing is retried.
#[instrument(skip_all, fields(force = options.force, limit = ?options.limit))]
pub async fn dump_courses(
    ctx: &SinkContext,
    options: &DumpCoursesOptions,
    progress: &dyn ProgressReporter,
) -> Result<DumpCoursesSummary> {
    let start = Instant::now();

    progress.phase("Listing courses");
    let only: HashSet<String> = options
        .ids
        .iter()
        .map(|k| k.for_branch_none().to_string())
        .collect();
    let skip: HashSet<String> = options
        .skip_ids
        .iter()
        .map(|k| k.for_branch_none().to_string())
        .collect();

    let courses: Vec<CourseKey> = ctx
        .summaries
        .list_course_keys()
        .await?
        .into_iter()
        .filter(|k| {
            let key = k.for_branch_none().to_string();
            (only.is_empty() || only.contains(&key)) && !skip.contains(&key)
        })
        .collect();
    info!(courses = courses.len(), "courses selected");

    progress.phase("Dumping courses");
    let mut summary = DumpCoursesSummary::default();
    let total = courses.len();

    for (i, course_key) in courses.iter().enumerate() {
        if options.limit.is_some_and(|limit| summary.dumped.len() >= limit) {
            info!(limit = ?options.limit, "dump limit reached");
            break;
        }

        match dump_course(ctx, course_key, options.force).await {
            Ok(result) => {
                progress.course_done(&result, i + 1, total);
                if result.dumped() {
                    summary.dumped.push(result);
                } else {
                    summary.skipped.push(result);
                }
            }
            Err(e) => {
                error!(course_key = %course_key, error = %e, "course dump failed");
                progress.course_failed(course_key, &e.to_string());
                summary.failed.push((course_key.clone(), e.to_string()));
            }
        }
    }

    summary.elapsed = start.elapsed();
    if !summary.failed.is_empty() {
        warn!(failed = summary.failed.len(), "some courses failed to dump");
    }
    info!(
        dumped = summary.dumped.len(),
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "bulk dump complete"
    );
    Ok(summary)
}
