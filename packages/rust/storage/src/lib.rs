//! libSQL-backed local content store (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding published course
//! content (course overviews, blocks, child order, tags) and the user models
//! the single-row sinks dump. It implements the `aspects-core` adapter traits.
//!
//! **Access rules:**
//! - `aspects import`: read-write via [`Storage::open`]
//! - dump commands and the listener: read-only via [`Storage::open_readonly`]

mod migrations;
pub mod snapshot;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::{debug, warn};

use aspects_core::adapters::{CourseSummaryStore, ModelStore, TagLookup, TreeFetcher};
use aspects_shared::{
    AspectsError, CourseKey, CourseSummary, CourseTree, ExternalIdRecord, Result, TreeNode,
    UsageKey, UserRetirement,
};

pub use snapshot::{CourseSnapshot, ImportSummary, Snapshot, SnapshotBlock};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn db_err(e: libsql::Error) -> AspectsError {
    AspectsError::Storage(e.to_string())
}

fn ts_to_text(ts: Option<&DateTime<Utc>>) -> Option<String> {
    ts.map(DateTime::to_rfc3339)
}

fn ts_from_text(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| AspectsError::Storage(format!("invalid date {s:?}: {e}")))
    })
    .transpose()
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AspectsError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AspectsError::not_found(format!(
                "content store {} (run `aspects import` first)",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    AspectsError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(AspectsError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Course overviews
    // -----------------------------------------------------------------------

    /// Get a course overview by key.
    pub async fn get_course(&self, course_key: &CourseKey) -> Result<Option<CourseSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT course_key, display_name, start_at, end_at, enrollment_start,
                        enrollment_end, self_paced, created, modified, extra_json
                 FROM courses WHERE course_key = ?1",
                params![course_key.for_branch_none().to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_course(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Every course key, sorted.
    pub async fn list_courses(&self) -> Result<Vec<CourseKey>> {
        let rows = self
            .conn
            .query("SELECT course_key FROM courses ORDER BY course_key", params![])
            .await
            .map_err(db_err)?;

        collect_rows(rows, |row| {
            let key: String = row.get(0).map_err(db_err)?;
            key.parse()
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    /// Rebuild the published tree of `course_key` from `blocks` and
    /// `block_children`.
    ///
    /// Children that are unpublished or missing are left out; a child that
    /// would close a cycle is dropped with a warning.
    pub async fn load_tree(&self, course_key: &CourseKey) -> Result<CourseTree> {
        let key = course_key.for_branch_none().to_string();

        let rows = self
            .conn
            .query(
                "SELECT location, display_name, graded, completion_mode, edited_on
                 FROM blocks WHERE course_key = ?1 AND published = 1
                 ORDER BY location",
                params![key.as_str()],
            )
            .await
            .map_err(db_err)?;

        let published = collect_rows(rows, row_to_node).await?;
        let order: Vec<String> = published.iter().map(|n| n.location.to_string()).collect();
        let nodes: HashMap<String, TreeNode> = order.iter().cloned().zip(published).collect();

        let root_location = course_key.root_location().to_string();
        if !nodes.contains_key(&root_location) {
            return Err(AspectsError::not_found(format!("course {course_key}")));
        }

        let rows = self
            .conn
            .query(
                "SELECT c.parent, c.child FROM block_children c
                 JOIN blocks b ON b.location = c.parent
                 WHERE b.course_key = ?1
                 ORDER BY c.parent, c.position",
                params![key.as_str()],
            )
            .await
            .map_err(db_err)?;

        let edges = collect_rows(rows, |row| {
            Ok((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<String>(1).map_err(db_err)?,
            ))
        })
        .await?;
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for (parent, child) in edges {
            children.entry(parent).or_default().push(child);
        }

        let root = assemble_tree(&root_location, &nodes, &children)
            .ok_or_else(|| AspectsError::not_found(format!("course {course_key}")))?;

        let all_nodes = order
            .iter()
            .filter_map(|location| nodes.get(location).cloned())
            .collect::<Vec<_>>();

        debug!(course_key = %course_key, blocks = all_nodes.len(), "course tree loaded");
        Ok(CourseTree { root, all_nodes })
    }

    /// Tags on a block, sorted.
    pub async fn block_tags(&self, location: &UsageKey) -> Result<BTreeSet<String>> {
        let rows = self
            .conn
            .query(
                "SELECT tag FROM block_tags WHERE location = ?1",
                params![location.strip_branch_and_version().to_string()],
            )
            .await
            .map_err(db_err)?;

        let tags = collect_rows(rows, |row| row.get::<String>(0).map_err(db_err)).await?;
        Ok(tags.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // User models
    // -----------------------------------------------------------------------

    pub async fn get_external_id_record(&self, id: i64) -> Result<Option<ExternalIdRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, external_user_id, external_id_type, user_id, username, created
                 FROM external_ids WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ExternalIdRecord {
                id: row.get(0).map_err(db_err)?,
                external_user_id: row.get(1).map_err(db_err)?,
                external_id_type: row.get(2).map_err(db_err)?,
                user_id: row.get(3).map_err(db_err)?,
                username: row.get(4).map_err(db_err)?,
                created: ts_from_text(row.get::<String>(5).ok())?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    pub async fn get_user_retirement_record(&self, user_id: i64) -> Result<Option<UserRetirement>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id, username, created FROM user_retirements WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(UserRetirement {
                user_id: row.get(0).map_err(db_err)?,
                username: row.get(1).map_err(db_err)?,
                created: ts_from_text(row.get::<String>(2).ok())?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }
}

/// Drain `rows` through `map`. An error while stepping fails the whole read
/// instead of ending it early.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    mut map: impl FnMut(&libsql::Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// A node being assembled and the index of its next child to visit.
struct Frame<'a> {
    location: &'a str,
    node: TreeNode,
    children: &'a [String],
    next: usize,
}

impl<'a> Frame<'a> {
    fn open(
        location: &'a str,
        nodes: &HashMap<String, TreeNode>,
        children: &'a HashMap<String, Vec<String>>,
    ) -> Option<Self> {
        Some(Self {
            location,
            node: nodes.get(location)?.clone(),
            children: children.get(location).map(Vec::as_slice).unwrap_or(&[]),
            next: 0,
        })
    }
}

/// Assemble the tree under `root` without recursion. Children missing from
/// `nodes` are skipped; an edge back to an ancestor is dropped with a warning.
fn assemble_tree(
    root: &str,
    nodes: &HashMap<String, TreeNode>,
    children: &HashMap<String, Vec<String>>,
) -> Option<TreeNode> {
    let mut stack = vec![Frame::open(root, nodes, children)?];
    let mut path: HashSet<&str> = HashSet::from([root]);

    loop {
        let top = stack.last_mut()?;
        let kids = top.children;
        if let Some(child) = kids.get(top.next) {
            top.next += 1;
            let child = child.as_str();
            if path.contains(child) {
                warn!(parent = top.location, child, "cycle in block children, dropping edge");
                continue;
            }
            if let Some(frame) = Frame::open(child, nodes, children) {
                path.insert(child);
                stack.push(frame);
            }
            continue;
        }

        let done = stack.pop()?;
        path.remove(done.location);
        match stack.last_mut() {
            Some(parent) => parent.node.children.push(done.node),
            None => return Some(done.node),
        }
    }
}

/// Convert a `blocks` row to a childless [`TreeNode`].
fn row_to_node(row: &libsql::Row) -> Result<TreeNode> {
    let location: String = row.get(0).map_err(db_err)?;
    Ok(TreeNode {
        location: location.parse()?,
        display_name: row.get::<String>(1).ok(),
        graded: row.get::<i64>(2).ok().map(|v| v != 0),
        completion_mode: row.get::<String>(3).ok(),
        edited_on: ts_from_text(row.get::<String>(4).ok())?,
        children: Vec::new(),
    })
}

/// Convert a `courses` row to a [`CourseSummary`].
fn row_to_course(row: &libsql::Row) -> Result<CourseSummary> {
    let key: String = row.get(0).map_err(db_err)?;
    let extra: String = row.get(9).map_err(db_err)?;
    Ok(CourseSummary {
        course_key: key.parse()?,
        display_name: row.get::<String>(1).ok(),
        start: ts_from_text(row.get::<String>(2).ok())?,
        end: ts_from_text(row.get::<String>(3).ok())?,
        enrollment_start: ts_from_text(row.get::<String>(4).ok())?,
        enrollment_end: ts_from_text(row.get::<String>(5).ok())?,
        self_paced: row.get::<i64>(6).map_err(db_err)? != 0,
        created: ts_from_text(row.get::<String>(7).ok())?,
        modified: ts_from_text(row.get::<String>(8).ok())?,
        extra: serde_json::from_str(&extra)?,
    })
}

// ---------------------------------------------------------------------------
// Adapter implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl TreeFetcher for Storage {
    async fn get_tree(&self, course_key: &CourseKey) -> Result<CourseTree> {
        self.load_tree(course_key).await
    }
}

#[async_trait]
impl TagLookup for Storage {
    async fn get_tags(&self, location: &UsageKey) -> BTreeSet<String> {
        match self.block_tags(location).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(location = %location, error = %e, "tag lookup failed, using no tags");
                BTreeSet::new()
            }
        }
    }
}

#[async_trait]
impl CourseSummaryStore for Storage {
    async fn get_course_summary(&self, course_key: &CourseKey) -> Result<Option<CourseSummary>> {
        self.get_course(course_key).await
    }

    async fn list_course_keys(&self) -> Result<Vec<CourseKey>> {
        self.list_courses().await
    }
}

#[async_trait]
impl ModelStore for Storage {
    async fn get_external_id(&self, id: i64) -> Result<Option<ExternalIdRecord>> {
        self.get_external_id_record(id).await
    }

    async fn get_user_retirement(&self, user_id: i64) -> Result<Option<UserRetirement>> {
        self.get_user_retirement_record(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aspects_core::memory::RecordingWarehouse;
    use aspects_core::pipeline;
    use aspects_core::sinks::{SinkContext, tables};
    use aspects_shared::SinkSettings;
    use chrono::TimeZone;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("aspects_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn key() -> CourseKey {
        CourseKey::new("edX", "DemoX", "Demo")
    }

    fn loc(block_type: &str, id: &str) -> UsageKey {
        UsageKey::new(key(), block_type, id)
    }

    fn block(location: UsageKey, children: Vec<UsageKey>) -> SnapshotBlock {
        SnapshotBlock {
            location,
            display_name: None,
            graded: None,
            completion_mode: None,
            edited_on: None,
            published: true,
            children,
            tags: Vec::new(),
        }
    }

    /// course > [c2, c1] (authoring order c2 first) ; c1 > v1 ; c2 > v2 (unpublished)
    fn snapshot() -> Snapshot {
        let mut v2 = block(loc("vertical", "v2"), vec![]);
        v2.published = false;
        let mut v1 = block(loc("vertical", "v1"), vec![]);
        v1.graded = Some(true);
        v1.tags = vec!["topic:intro".into()];
        let mut summary = CourseSummary::new(key());
        summary.display_name = Some("Demo".into());
        summary.modified = Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());

        Snapshot {
            courses: vec![CourseSnapshot {
                course: summary,
                blocks: vec![
                    block(key().root_location(), vec![loc("chapter", "c2"), loc("chapter", "c1")]),
                    block(loc("chapter", "c1"), vec![loc("vertical", "v1")]),
                    block(loc("chapter", "c2"), vec![loc("vertical", "v2")]),
                    v1,
                    v2,
                    block(loc("about", "overview"), vec![]),
                ],
            }],
            external_ids: vec![ExternalIdRecord {
                id: 9,
                external_user_id: "ext-9".into(),
                external_id_type: "xapi".into(),
                user_id: 4,
                username: "learner".into(),
                created: None,
            }],
            user_retirements: vec![UserRetirement {
                user_id: 4,
                username: "learner".into(),
                created: None,
            }],
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("aspects_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn tree_keeps_authoring_order_and_drops_unpublished() {
        let storage = test_storage().await;
        storage.import_snapshot(&snapshot()).await.unwrap();

        let tree = storage.get_tree(&key()).await.unwrap();
        let chapters: Vec<_> = tree
            .root
            .children
            .iter()
            .map(|c| c.location.block_id.as_str())
            .collect();
        assert_eq!(chapters, vec!["c2", "c1"]);
        assert!(tree.root.children[0].children.is_empty());
        assert_eq!(tree.root.children[1].children[0].graded, Some(true));
        // 5 published blocks, including the detached about block
        assert_eq!(tree.all_nodes.len(), 5);
    }

    #[tokio::test]
    async fn deep_chain_loads_without_recursion() {
        let storage = test_storage().await;
        let depth = 2000;
        let mut snap = snapshot();
        let mut blocks = vec![block(key().root_location(), vec![loc("vertical", "d0")])];
        for i in 0..depth {
            let next = if i + 1 < depth {
                vec![loc("vertical", &format!("d{}", i + 1))]
            } else {
                vec![]
            };
            blocks.push(block(loc("vertical", &format!("d{i}")), next));
        }
        snap.courses[0].blocks = blocks;
        storage.import_snapshot(&snap).await.unwrap();

        let tree = storage.get_tree(&key()).await.unwrap();
        assert_eq!(tree.all_nodes.len(), depth + 1);
        let mut levels = 0;
        let mut node = &tree.root;
        while let Some(child) = node.children.first() {
            levels += 1;
            node = child;
        }
        assert_eq!(levels, depth);
        assert_eq!(node.location.block_id, format!("d{}", depth - 1));
    }

    #[tokio::test]
    async fn child_edge_back_to_an_ancestor_is_dropped() {
        let storage = test_storage().await;
        let mut snap = snapshot();
        snap.courses[0].blocks = vec![
            block(key().root_location(), vec![loc("chapter", "c1")]),
            block(loc("chapter", "c1"), vec![loc("vertical", "v1")]),
            block(loc("vertical", "v1"), vec![loc("chapter", "c1"), loc("html", "h1")]),
            block(loc("html", "h1"), vec![]),
        ];
        storage.import_snapshot(&snap).await.unwrap();

        let tree = storage.get_tree(&key()).await.unwrap();
        let v1 = &tree.root.children[0].children[0];
        let kids: Vec<_> = v1.children.iter().map(|c| c.location.block_id.as_str()).collect();
        assert_eq!(kids, vec!["h1"]);
        assert_eq!(tree.all_nodes.len(), 4);
    }

    #[tokio::test]
    async fn row_error_midway_fails_the_read() {
        let storage = test_storage().await;
        let result: Result<Vec<()>> = async {
            let rows = storage
                .conn
                .query(
                    "SELECT json_extract(v, '$.a') FROM
                     (SELECT '{}' AS v UNION ALL SELECT 'not json')",
                    params![],
                )
                .await
                .map_err(db_err)?;
            collect_rows(rows, |_| Ok(())).await
        }
        .await;
        assert!(matches!(result, Err(AspectsError::Storage(_))));
    }

    #[tokio::test]
    async fn unknown_course_is_not_found() {
        let storage = test_storage().await;
        let err = storage
            .get_tree(&CourseKey::new("edX", "Nope", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AspectsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn tags_and_summaries() {
        let storage = test_storage().await;
        storage.import_snapshot(&snapshot()).await.unwrap();

        let tags = storage.get_tags(&loc("vertical", "v1")).await;
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["topic:intro"]);
        assert!(storage.get_tags(&loc("html", "missing")).await.is_empty());

        let summary = storage.get_course_summary(&key()).await.unwrap().unwrap();
        assert_eq!(summary.display_name.as_deref(), Some("Demo"));
        assert_eq!(
            summary.last_modified_string().as_deref(),
            Some("2024-01-02 00:00:00.000000+00:00")
        );
        assert_eq!(storage.list_course_keys().await.unwrap(), vec![key()]);
    }

    #[tokio::test]
    async fn user_models() {
        let storage = test_storage().await;
        storage.import_snapshot(&snapshot()).await.unwrap();

        let ext = storage.get_external_id(9).await.unwrap().unwrap();
        assert_eq!(ext.user_id, 4);
        assert!(storage.get_external_id(10).await.unwrap().is_none());
        assert!(storage.get_user_retirement(4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reimport_replaces_course_blocks() {
        let storage = test_storage().await;
        storage.import_snapshot(&snapshot()).await.unwrap();

        let mut smaller = snapshot();
        smaller.courses[0].blocks = vec![block(key().root_location(), vec![])];
        storage.import_snapshot(&smaller).await.unwrap();

        let tree = storage.get_tree(&key()).await.unwrap();
        assert!(tree.root.children.is_empty());
        assert_eq!(tree.all_nodes.len(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("aspects_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.import_snapshot(&snapshot()).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get_tree(&key()).await.is_ok());
        let result = ro.import_snapshot(&snapshot()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("aspects_missing_{}.db", Uuid::now_v7()));
        let err = Storage::open_readonly(&tmp).await.err().unwrap();
        assert!(matches!(err, AspectsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stored_course_dumps_end_to_end() {
        let storage = test_storage().await;
        storage.import_snapshot(&snapshot()).await.unwrap();

        let wh = Arc::new(RecordingWarehouse::new());
        let ctx = SinkContext::new(Arc::new(storage), wh.clone(), SinkSettings::default());
        let result = pipeline::dump_course(&ctx, &key(), false).await.unwrap();

        assert!(result.dumped());
        assert_eq!(result.overview_rows, 1);
        // course, c2, c1, v1 + detached about
        assert_eq!(result.block_rows, 5);
        assert_eq!(wh.rows_for(tables::COURSE_BLOCKS).await.len(), 5);
    }
}
