//! Snapshot import: load published course content and user models from a
//! JSON document into the content store.
//!
//! ```json
//! {
//!   "courses": [
//!     {
//!       "course": { "course_key": "course-v1:edX+DemoX+Demo", "modified": "..." },
//!       "blocks": [
//!         { "location": "block-v1:edX+DemoX+Demo+type@course+block@course",
//!           "children": ["block-v1:edX+DemoX+Demo+type@chapter+block@c1"] }
//!       ]
//!     }
//!   ],
//!   "external_ids": [],
//!   "user_retirements": []
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::params;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use aspects_shared::{
    AspectsError, CourseSummary, ExternalIdRecord, Result, UsageKey, UserRetirement,
};

use crate::{Storage, db_err, ts_to_text};

/// A full import document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub courses: Vec<CourseSnapshot>,
    #[serde(default)]
    pub external_ids: Vec<ExternalIdRecord>,
    #[serde(default)]
    pub user_retirements: Vec<UserRetirement>,
}

/// One published course: its overview plus every block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseSnapshot {
    pub course: CourseSummary,
    #[serde(default)]
    pub blocks: Vec<SnapshotBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBlock {
    pub location: UsageKey,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub graded: Option<bool>,
    #[serde(default)]
    pub completion_mode: Option<String>,
    #[serde(default)]
    pub edited_on: Option<DateTime<Utc>>,
    #[serde(default = "default_published")]
    pub published: bool,
    /// Child locations in authoring order.
    #[serde(default)]
    pub children: Vec<UsageKey>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_published() -> bool {
    true
}

/// Counts from one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub courses: usize,
    pub blocks: usize,
    pub external_ids: usize,
    pub user_retirements: usize,
}

impl Snapshot {
    /// Read and parse a snapshot file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AspectsError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reject blocks filed under the wrong course and courses without a root.
    pub fn validate(&self) -> Result<()> {
        for course in &self.courses {
            let key = course.course.course_key.for_branch_none();
            let root = key.root_location();
            let mut has_root = false;

            for block in &course.blocks {
                if block.location.course_key.for_branch_none() != key {
                    return Err(AspectsError::validation(format!(
                        "block {} does not belong to course {key}",
                        block.location
                    )));
                }
                has_root |= block.location.strip_branch_and_version() == root;
            }

            if !has_root {
                return Err(AspectsError::validation(format!(
                    "course {key} has no root block {root}"
                )));
            }
        }
        Ok(())
    }
}

impl Storage {
    /// Import `snapshot` in a single transaction.
    ///
    /// Each course's previous blocks are replaced wholesale, so blocks deleted
    /// from a course disappear from its tree. User models are upserted.
    #[instrument(skip_all, fields(courses = snapshot.courses.len()))]
    pub async fn import_snapshot(&self, snapshot: &Snapshot) -> Result<ImportSummary> {
        self.check_writable()?;
        snapshot.validate()?;

        let tx = self.conn.transaction().await.map_err(db_err)?;
        let mut summary = ImportSummary::default();

        for course in &snapshot.courses {
            let key = course.course.course_key.for_branch_none().to_string();

            // Foreign keys are not enforced, so clear dependents first.
            for sql in [
                "DELETE FROM block_children WHERE parent IN
                   (SELECT location FROM blocks WHERE course_key = ?1)",
                "DELETE FROM block_tags WHERE location IN
                   (SELECT location FROM blocks WHERE course_key = ?1)",
                "DELETE FROM blocks WHERE course_key = ?1",
            ] {
                tx.execute(sql, params![key.as_str()])
                    .await
                    .map_err(db_err)?;
            }

            let extra = serde_json::to_string(&course.course.extra)?;
            let c = &course.course;
            tx.execute(
                "INSERT OR REPLACE INTO courses (course_key, display_name, start_at, end_at,
                        enrollment_start, enrollment_end, self_paced, created, modified, extra_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    key.as_str(),
                    c.display_name.as_deref(),
                    ts_to_text(c.start.as_ref()),
                    ts_to_text(c.end.as_ref()),
                    ts_to_text(c.enrollment_start.as_ref()),
                    ts_to_text(c.enrollment_end.as_ref()),
                    i64::from(c.self_paced),
                    ts_to_text(c.created.as_ref()),
                    ts_to_text(c.modified.as_ref()),
                    extra,
                ],
            )
            .await
            .map_err(db_err)?;

            let known: HashSet<String> = course
                .blocks
                .iter()
                .map(|b| b.location.strip_branch_and_version().to_string())
                .collect();

            for block in &course.blocks {
                let location = block.location.strip_branch_and_version().to_string();
                tx.execute(
                    "INSERT OR REPLACE INTO blocks (location, course_key, block_type, display_name,
                            graded, completion_mode, edited_on, published)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        location.as_str(),
                        key.as_str(),
                        block.location.block_type.as_str(),
                        block.display_name.as_deref(),
                        block.graded.map(i64::from),
                        block.completion_mode.as_deref(),
                        ts_to_text(block.edited_on.as_ref()),
                        i64::from(block.published),
                    ],
                )
                .await
                .map_err(db_err)?;

                for (position, child) in block.children.iter().enumerate() {
                    let child = child.strip_branch_and_version().to_string();
                    if !known.contains(&child) {
                        warn!(parent = %location, child = %child, "child block missing from snapshot");
                    }
                    tx.execute(
                        "INSERT OR REPLACE INTO block_children (parent, position, child) VALUES (?1, ?2, ?3)",
                        params![location.as_str(), position as i64, child],
                    )
                    .await
                    .map_err(db_err)?;
                }

                for tag in &block.tags {
                    tx.execute(
                        "INSERT OR IGNORE INTO block_tags (location, tag) VALUES (?1, ?2)",
                        params![location.as_str(), tag.as_str()],
                    )
                    .await
                    .map_err(db_err)?;
                }
                summary.blocks += 1;
            }
            summary.courses += 1;
        }

        for record in &snapshot.external_ids {
            tx.execute(
                "INSERT OR REPLACE INTO external_ids
                        (id, external_user_id, external_id_type, user_id, username, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.external_user_id.as_str(),
                    record.external_id_type.as_str(),
                    record.user_id,
                    record.username.as_str(),
                    ts_to_text(record.created.as_ref()),
                ],
            )
            .await
            .map_err(db_err)?;
            summary.external_ids += 1;
        }

        for retirement in &snapshot.user_retirements {
            tx.execute(
                "INSERT OR REPLACE INTO user_retirements (user_id, username, created)
                 VALUES (?1, ?2, ?3)",
                params![
                    retirement.user_id,
                    retirement.username.as_str(),
                    ts_to_text(retirement.created.as_ref()),
                ],
            )
            .await
            .map_err(db_err)?;
            summary.user_retirements += 1;
        }

        tx.commit().await.map_err(db_err)?;

        info!(
            courses = summary.courses,
            blocks = summary.blocks,
            external_ids = summary.external_ids,
            user_retirements = summary.user_retirements,
            "snapshot imported"
        );
        Ok(summary)
    }
}
