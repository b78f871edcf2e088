//! Snapshot forest queries, search, and mutations.
//!
//! The forest is owned entirely by the platform: every query re-fetches
//! the authoritative structure, and nothing is cached, diffed, or merged
//! locally. Mutations return a success boolean — a vanished node is a
//! `false`, never an error.

use crate::error::{VsphereErrorKind, VsphereResult};
use crate::session::VsphereSession;
use crate::types::{SnapshotNode, SnapshotRecord};

use log::warn;

/// Snapshot operations on a VM.
pub struct SnapshotManager<'a> {
    session: &'a VsphereSession,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(session: &'a VsphereSession) -> Self {
        Self { session }
    }

    /// Fetch the VM's snapshot forest, freshly, as nested trees.
    pub async fn list(&self, vm_ref: &str) -> VsphereResult<Vec<SnapshotNode>> {
        let path = format!("/api/vcenter/vm/{vm_ref}/snapshots/tree");
        // The API returns 404 when the VM has no snapshots; treat as empty.
        match self.session.get::<Vec<SnapshotNode>>(&path).await {
            Ok(forest) => Ok(forest),
            Err(e) if e.kind == VsphereErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Take a new snapshot. Returns the platform-assigned handle for the
    /// persistence layer to record.
    pub async fn create(
        &self,
        vm_ref: &str,
        name: &str,
        description: Option<&str>,
    ) -> VsphereResult<String> {
        #[derive(serde::Serialize)]
        struct CreateSpec<'r> {
            name: &'r str,
            #[serde(skip_serializing_if = "Option::is_none")]
            description: Option<&'r str>,
        }
        #[derive(serde::Deserialize)]
        struct Created {
            value: String,
        }
        let path = format!("/api/vcenter/vm/{vm_ref}/snapshots");
        let resp: Created = self
            .session
            .post(&path, &CreateSpec { name, description })
            .await?;
        Ok(resp.value)
    }

    /// Revert the VM to a snapshot taken from a fresh `list()`.
    pub async fn revert(&self, vm_ref: &str, node: &SnapshotNode) -> VsphereResult<bool> {
        let path = format!(
            "/api/vcenter/vm/{vm_ref}/snapshots/{}?action=revert",
            node.remote_ref
        );
        self.boolean(self.session.post_empty(&path).await, "revert", node)
    }

    /// Rename a snapshot and replace its description.
    pub async fn rename(
        &self,
        vm_ref: &str,
        node: &SnapshotNode,
        name: &str,
        description: Option<&str>,
    ) -> VsphereResult<bool> {
        #[derive(serde::Serialize)]
        struct RenameSpec<'r> {
            name: &'r str,
            #[serde(skip_serializing_if = "Option::is_none")]
            description: Option<&'r str>,
        }
        let path = format!("/api/vcenter/vm/{vm_ref}/snapshots/{}", node.remote_ref);
        self.boolean(
            self.session.patch(&path, &RenameSpec { name, description }).await,
            "rename",
            node,
        )
    }

    /// Delete a snapshot, optionally cascading to its children.
    ///
    /// With `cascade_children = false` on a node that has children, the
    /// platform reattaches the orphans by its own rules; that behaviour is
    /// not reproduced locally.
    pub async fn remove(
        &self,
        vm_ref: &str,
        node: &SnapshotNode,
        cascade_children: bool,
    ) -> VsphereResult<bool> {
        let path = if cascade_children {
            format!(
                "/api/vcenter/vm/{vm_ref}/snapshots/{}?remove_children=true",
                node.remote_ref
            )
        } else {
            format!("/api/vcenter/vm/{vm_ref}/snapshots/{}", node.remote_ref)
        };
        self.boolean(self.session.delete(&path).await, "remove", node)
    }

    fn boolean(
        &self,
        result: VsphereResult<()>,
        op: &str,
        node: &SnapshotNode,
    ) -> VsphereResult<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind == VsphereErrorKind::NotFound => {
                warn!("Snapshot {} gone before {}", node.remote_ref, op);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

// ── Forest search ────────────────────────────────────────────────────────────

/// Depth-first, pre-order walk stopping at the first node matching `pred`.
/// Each node is visited at most once.
fn find_node<'f, P>(forest: &'f [SnapshotNode], mut pred: P) -> Option<&'f SnapshotNode>
where
    P: FnMut(&SnapshotNode) -> bool,
{
    let mut stack: Vec<&SnapshotNode> = forest.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if pred(node) {
            return Some(node);
        }
        stack.extend(node.children.iter().rev());
    }
    None
}

/// Find a node by its numeric platform id.
pub fn find_by_id(forest: &[SnapshotNode], id: u64) -> Option<&SnapshotNode> {
    find_node(forest, |n| n.id == id)
}

/// Find a node by its opaque platform handle.
pub fn find_by_ref<'f>(forest: &'f [SnapshotNode], remote_ref: &str) -> Option<&'f SnapshotNode> {
    find_node(forest, |n| n.remote_ref == remote_ref)
}

// ── Local record linkage ─────────────────────────────────────────────────────

/// Whether `parent` may be recorded as the parent of `child`: both records
/// must belong to the same VM.
pub fn can_link_parent(child: &SnapshotRecord, parent: &SnapshotRecord) -> bool {
    child.vm_ref == parent.vm_ref && child.remote_ref != parent.remote_ref
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(id: u64, name: &str, children: Vec<SnapshotNode>) -> SnapshotNode {
        SnapshotNode {
            remote_ref: format!("snapshot-{id}"),
            id,
            name: name.into(),
            description: None,
            created_at: Utc::now(),
            children,
        }
    }

    /// Three-level chain A[B[C]] plus an independent root D.
    fn fixture() -> Vec<SnapshotNode> {
        vec![
            node(1, "A", vec![node(2, "B", vec![node(3, "C", vec![])])]),
            node(4, "D", vec![]),
        ]
    }

    #[test]
    fn finds_deep_node_by_id() {
        let forest = fixture();
        let c = find_by_id(&forest, 3).unwrap();
        assert_eq!(c.name, "C");
        assert_eq!(c.remote_ref, "snapshot-3");
    }

    #[test]
    fn finds_node_by_remote_ref() {
        let forest = fixture();
        let b = find_by_ref(&forest, "snapshot-2").unwrap();
        assert_eq!(b.id, 2);
        assert_eq!(b.children.len(), 1);
    }

    #[test]
    fn absent_id_is_none() {
        let forest = fixture();
        assert!(find_by_id(&forest, 99).is_none());
        assert!(find_by_ref(&forest, "snapshot-99").is_none());
    }

    #[test]
    fn search_visits_each_node_exactly_once() {
        let forest = fixture();
        let mut visited = Vec::new();
        let found = find_node(&forest, |n| {
            visited.push(n.id);
            false
        });
        assert!(found.is_none());
        assert_eq!(visited.len(), 4);

        let mut unique = visited.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), visited.len());
    }

    #[test]
    fn search_is_preorder() {
        let forest = fixture();
        let mut order = Vec::new();
        find_node(&forest, |n| {
            order.push(n.name.clone());
            false
        });
        assert_eq!(order, ["A", "B", "C", "D"]);
    }

    #[test]
    fn identity_preserved_through_search() {
        let forest = fixture();
        let found = find_by_id(&forest, 2).unwrap();
        // The returned reference is the node inside the fetched forest,
        // not a copy.
        assert!(std::ptr::eq(found, &forest[0].children[0]));
    }

    #[test]
    fn forest_wire_decode_nests_children() {
        let json = r#"[
            {
                "remoteRef": "snapshot-10",
                "id": 10,
                "name": "base",
                "createdAt": "2024-03-01T12:00:00Z",
                "children": [
                    {
                        "remoteRef": "snapshot-11",
                        "id": 11,
                        "name": "patched",
                        "description": "after update",
                        "createdAt": "2024-03-02T09:30:00Z"
                    }
                ]
            }
        ]"#;
        let forest: Vec<SnapshotNode> = serde_json::from_str(json).unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].description.as_deref(), Some("after update"));
        assert!(forest[0].children[0].children.is_empty());
    }

    #[test]
    fn parent_linkage_requires_same_vm() {
        let child = SnapshotRecord {
            vm_ref: "vm-1".into(),
            remote_ref: "snapshot-2".into(),
            name: "child".into(),
            description: None,
            parent_ref: None,
        };
        let same_vm = SnapshotRecord {
            vm_ref: "vm-1".into(),
            remote_ref: "snapshot-1".into(),
            name: "parent".into(),
            description: None,
            parent_ref: None,
        };
        let other_vm = SnapshotRecord {
            vm_ref: "vm-2".into(),
            remote_ref: "snapshot-9".into(),
            name: "stranger".into(),
            description: None,
            parent_ref: None,
        };

        assert!(can_link_parent(&child, &same_vm));
        assert!(!can_link_parent(&child, &other_vm));
        assert!(!can_link_parent(&child, &child));
    }
}
