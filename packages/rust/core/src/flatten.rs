//! Course tree flattening and annotation.
//!
//! Turns a [`CourseTree`] into the ordered, deduplicated record sequence
//! written to `course_blocks`:
//! 1. Pre-order walk from the root in authoring order
//! 2. Detached blocks from the flat node list appended after it
//! 3. Section / subsection / unit counters applied in sequence order
//! 4. Tags attached per block
//! 5. Dedupe by stripped location

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, instrument};

use aspects_shared::{AnnotatedRecord, CourseTree, TreeNode, block_types};

use crate::adapters::TagLookup;

/// Flattens course trees for one run. Configuration is fixed at construction.
pub struct FlattenEngine<'a> {
    detached_types: HashSet<String>,
    tags: Option<&'a dyn TagLookup>,
}

impl<'a> FlattenEngine<'a> {
    /// `tags` is `None` when tagging is disabled; records then carry no tags.
    pub fn new(detached_types: HashSet<String>, tags: Option<&'a dyn TagLookup>) -> Self {
        Self {
            detached_types,
            tags,
        }
    }

    pub fn is_detached(&self, block_type: &str) -> bool {
        self.detached_types.contains(block_type)
    }

    /// Flatten `tree` into annotated records.
    ///
    /// Before dedupe, `order` runs 1..=N over reachable plus detached nodes.
    /// Dedupe keeps the last record for an identity at the position where
    /// that identity first appeared.
    #[instrument(skip_all, fields(all_nodes = tree.all_nodes.len()))]
    pub async fn flatten(&self, tree: &CourseTree) -> Vec<AnnotatedRecord> {
        let mut sequence = walk_preorder(&tree.root);
        let reachable = sequence.len();
        sequence.extend(
            tree.all_nodes
                .iter()
                .filter(|node| self.is_detached(node.block_type())),
        );

        let mut records = Vec::with_capacity(sequence.len());
        let mut section = 0u32;
        let mut subsection = 0u32;
        let mut unit = 0u32;

        for (idx, node) in sequence.into_iter().enumerate() {
            let detached = self.is_detached(node.block_type());
            let (s, ss, u) = if detached {
                (0, 0, 0)
            } else {
                match node.block_type() {
                    block_types::CHAPTER => {
                        section += 1;
                        subsection = 0;
                        unit = 0;
                    }
                    block_types::SEQUENTIAL => {
                        subsection += 1;
                        unit = 0;
                    }
                    block_types::VERTICAL => unit += 1,
                    _ => {}
                }
                (section, subsection, unit)
            };

            let tags = match self.tags {
                Some(lookup) => lookup.get_tags(&node.location).await,
                None => BTreeSet::new(),
            };

            records.push(AnnotatedRecord {
                block: node.snapshot(),
                detached,
                order: idx as u32 + 1,
                section: s,
                subsection: ss,
                unit: u,
                tags,
            });
        }

        let emitted = records.len();
        let deduped = dedupe_last_wins(records);
        debug!(
            reachable,
            detached = emitted - reachable,
            emitted = deduped.len(),
            "course tree flattened"
        );
        deduped
    }
}

/// Pre-order walk over `root`, children in store order.
fn walk_preorder(root: &TreeNode) -> Vec<&TreeNode> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        out.push(node);
        stack.extend(node.children.iter().rev());
    }
    out
}

/// Collapse records sharing an identity. The survivor is the last one seen;
/// it takes the slot of the first.
fn dedupe_last_wins(records: Vec<AnnotatedRecord>) -> Vec<AnnotatedRecord> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<AnnotatedRecord> = Vec::with_capacity(records.len());

    for record in records {
        let identity = record.identity();
        match slots.get(&identity) {
            Some(&slot) => out[slot] = record,
            None => {
                slots.insert(identity, out.len());
                out.push(record);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aspects_shared::{CourseKey, UsageKey};

    fn course() -> CourseKey {
        CourseKey::new("edX", "DemoX", "Demo")
    }

    fn node(block_type: &str, id: &str, children: Vec<TreeNode>) -> TreeNode {
        let mut n = TreeNode::leaf(UsageKey::new(course(), block_type, id));
        n.children = children;
        n
    }

    fn detached_defaults() -> HashSet<String> {
        ["html".to_string()].into_iter().collect()
    }

    /// Root with chapters C1 and C2; C1 > S1 > V1; detached html D.
    fn scenario_tree() -> CourseTree {
        let v1 = node("vertical", "V1", vec![]);
        let s1 = node("sequential", "S1", vec![v1.clone()]);
        let c1 = node("chapter", "C1", vec![s1.clone()]);
        let c2 = node("chapter", "C2", vec![]);
        let root = node("course", "course", vec![c1.clone(), c2.clone()]);
        let d = node("html", "D", vec![]);
        CourseTree {
            all_nodes: vec![root.clone(), c1, s1, v1, c2, d],
            root,
        }
    }

    struct FixedTags(HashMap<String, BTreeSet<String>>);

    #[async_trait]
    impl TagLookup for FixedTags {
        async fn get_tags(&self, location: &UsageKey) -> BTreeSet<String> {
            self.0.get(&location.to_string()).cloned().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn worked_scenario_orders_and_sections() {
        let engine = FlattenEngine::new(detached_defaults(), None);
        let records = engine.flatten(&scenario_tree()).await;

        let ids: Vec<_> = records
            .iter()
            .map(|r| r.block.location.block_id.as_str())
            .collect();
        assert_eq!(ids, vec!["course", "C1", "S1", "V1", "C2", "D"]);

        let orders: Vec<_> = records.iter().map(|r| r.order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4, 5, 6]);

        let sections: Vec<_> = records.iter().map(|r| r.section).collect();
        assert_eq!(sections, vec![0, 1, 1, 1, 2, 0]);

        let s1 = &records[2];
        assert_eq!((s1.subsection, s1.unit), (1, 0));
        let v1 = &records[3];
        assert_eq!((v1.subsection, v1.unit), (1, 1));
        let c2 = &records[4];
        assert_eq!((c2.subsection, c2.unit), (0, 0));

        let d = &records[5];
        assert!(d.detached);
        assert_eq!((d.section, d.subsection, d.unit), (0, 0, 0));
    }

    #[tokio::test]
    async fn root_without_children_yields_one_record() {
        let root = node("course", "course", vec![]);
        let tree = CourseTree {
            all_nodes: vec![root.clone()],
            root,
        };
        let engine = FlattenEngine::new(HashSet::new(), None);
        let records = engine.flatten(&tree).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order, 1);
        assert!(!records[0].detached);
    }

    #[tokio::test]
    async fn kth_chapter_gets_section_k() {
        let chapters: Vec<_> = (1..=5)
            .map(|i| {
                node(
                    "chapter",
                    &format!("ch{i}"),
                    vec![node(
                        "sequential",
                        &format!("seq{i}"),
                        vec![node(
                            "vertical",
                            &format!("v{i}"),
                            vec![node("problem", &format!("p{i}"), vec![])],
                        )],
                    )],
                )
            })
            .collect();
        let root = node("course", "course", chapters);
        let tree = CourseTree {
            all_nodes: vec![],
            root,
        };
        let engine = FlattenEngine::new(HashSet::new(), None);
        let records = engine.flatten(&tree).await;

        assert_eq!(records.len(), 1 + 5 * 4);
        for r in &records {
            let id = &r.block.location.block_id;
            if let Some(k) = id.strip_prefix("p") {
                let k: u32 = k.parse().unwrap();
                assert_eq!(r.section, k, "problem {id}");
                assert_eq!((r.subsection, r.unit), (1, 1));
            }
        }
        let orders: Vec<_> = records.iter().map(|r| r.order).collect();
        assert_eq!(orders, (1..=21).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn detached_records_are_zeroed_wherever_they_fall() {
        let mut tree = scenario_tree();
        for i in 0..3 {
            tree.all_nodes.push(node("static_tab", &format!("tab{i}"), vec![]));
        }
        let detached: HashSet<String> = ["html", "static_tab"].iter().map(|s| s.to_string()).collect();
        let engine = FlattenEngine::new(detached, None);
        let records = engine.flatten(&tree).await;

        let detached: Vec<_> = records.iter().filter(|r| r.detached).collect();
        assert_eq!(detached.len(), 4);
        for r in detached {
            assert_eq!((r.section, r.subsection, r.unit), (0, 0, 0));
        }
    }

    #[tokio::test]
    async fn no_detached_types_means_no_detached_segment() {
        let engine = FlattenEngine::new(HashSet::new(), None);
        let records = engine.flatten(&scenario_tree()).await;
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| !r.detached));
    }

    #[tokio::test]
    async fn tags_come_from_lookup_when_enabled() {
        let tree = scenario_tree();
        let v1 = UsageKey::new(course(), "vertical", "V1").to_string();
        let lookup = FixedTags(HashMap::from([(
            v1,
            BTreeSet::from(["difficulty:hard".to_string(), "topic:intro".to_string()]),
        )]));

        let engine = FlattenEngine::new(detached_defaults(), Some(&lookup));
        let records = engine.flatten(&tree).await;
        assert_eq!(records[3].tags.len(), 2);
        assert!(records[0].tags.is_empty());

        let engine = FlattenEngine::new(detached_defaults(), None);
        let records = engine.flatten(&tree).await;
        assert!(records.iter().all(|r| r.tags.is_empty()));
    }

    #[tokio::test]
    async fn branch_qualified_duplicates_collapse() {
        let mut qualified = course();
        qualified.branch = Some("published-branch".into());
        let a = node("html", "same", vec![]);
        let mut b = TreeNode::leaf(UsageKey::new(qualified, "html", "same"));
        b.display_name = Some("Second".into());
        let root = node("course", "course", vec![a]);
        let tree = CourseTree {
            all_nodes: vec![b],
            root,
        };

        let engine = FlattenEngine::new(detached_defaults(), None);
        let records = engine.flatten(&tree).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].block.display_name.as_deref(), Some("Second"));
    }

    /// A detached-type block that is also reachable from the root is emitted
    /// twice. Last write wins, so the survivor sits in the tree slot but
    /// carries the order of the detached copy.
    #[tokio::test]
    async fn detached_duplicate_overwrites_tree_record() {
        let html = node("html", "intro_text", vec![]);
        let vertical = node("vertical", "V1", vec![html.clone()]);
        let sequential = node("sequential", "S1", vec![vertical]);
        let chapter = node("chapter", "C1", vec![sequential]);
        let after = node("chapter", "C2", vec![]);
        let root = node("course", "course", vec![chapter, after]);
        let tree = CourseTree {
            all_nodes: vec![html],
            root,
        };

        let engine = FlattenEngine::new(detached_defaults(), None);
        let records = engine.flatten(&tree).await;

        // 6 reachable + 1 detached emitted, 1 collapsed
        assert_eq!(records.len(), 6);
        let survivor = &records[4];
        assert_eq!(survivor.block.location.block_id, "intro_text");
        assert!(survivor.detached);
        assert_eq!(survivor.order, 7);
        assert_eq!((survivor.section, survivor.subsection, survivor.unit), (0, 0, 0));
        // order is no longer increasing across the collapsed slot
        assert!(records[5].order < survivor.order);
    }

    #[tokio::test]
    async fn deep_tree_flattens() {
        let mut leaf = node("vertical", "deepest", vec![]);
        for i in 0..2_000 {
            leaf = node("html", &format!("n{i}"), vec![leaf]);
        }
        let root = node("course", "course", vec![leaf]);
        let tree = CourseTree {
            all_nodes: vec![],
            root,
        };
        let engine = FlattenEngine::new(HashSet::new(), None);
        let records = engine.flatten(&tree).await;
        assert_eq!(records.len(), 2_002);
        assert_eq!(records.last().unwrap().unit, 1);
    }
}
