//! Hierarchical status tree (distilled spec §3 "Status node", §4.1).
//!
//! Nodes live in an arena owned by the tree; children are owned by index,
//! the parent link is a plain (non-owning) index back into the same arena.
//! The tree itself is shared by `Arc` so that handles can be moved into
//! spawned tasks (§5, "shared mutability").

use std::sync::{Arc, Mutex};

use serde::Serialize;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    NotStarted,
    Preparing,
    InProgress,
    Finishing,
    Success,
    Failed,
    Skipped,
    ChildrenFailed,
}

impl StatusType {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusType::Success
                | StatusType::Failed
                | StatusType::Skipped
                | StatusType::ChildrenFailed
        )
    }

    pub fn is_bad(self) -> bool {
        matches!(self, StatusType::Failed | StatusType::ChildrenFailed)
    }
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    include_parent: bool,
    status_type: StatusType,
    status_text: String,
    messages: Vec<String>,
    children: Vec<NodeId>,
}

type SinkFn = dyn Fn(&[String], &str) + Send + Sync;

/// A rooted, ordered status tree, shared by handle across procedure tasks
/// and the HTTP reporter. Guarded by a single coarse lock, per the
/// concurrency model in §5.
pub struct StatusTree {
    inner: Mutex<Vec<Node>>,
    sink: Box<SinkFn>,
}

/// A cheap handle to one node in a [`StatusTree`].
#[derive(Clone)]
pub struct StatusHandle {
    tree: Arc<StatusTree>,
    id: NodeId,
}

fn default_sink(path: &[String], message: &str) {
    tracing::info!(path = %path.join(" : "), "{message}");
}

impl StatusTree {
    pub fn new(root_name: impl Into<String>) -> Arc<Self> {
        Self::with_sink(root_name, default_sink)
    }

    pub fn with_sink(
        root_name: impl Into<String>,
        sink: impl Fn(&[String], &str) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let root = Node {
            name: root_name.into(),
            parent: None,
            include_parent: true,
            status_type: StatusType::NotStarted,
            status_text: "Not Started".to_string(),
            messages: Vec::new(),
            children: Vec::new(),
        };
        Arc::new(StatusTree {
            inner: Mutex::new(vec![root]),
            sink: Box::new(sink),
        })
    }

    /// Obtain a handle to the root node.
    pub fn root(self: &Arc<Self>) -> StatusHandle {
        StatusHandle {
            tree: Arc::clone(self),
            id: 0,
        }
    }

    fn full_path(&self, id: NodeId, nodes: &[Node]) -> Vec<String> {
        let mut path = vec![nodes[id].name.clone()];
        let mut cur = id;
        loop {
            let node = &nodes[cur];
            if !node.include_parent {
                break;
            }
            match node.parent {
                Some(parent) => {
                    path.push(nodes[parent].name.clone());
                    cur = parent;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Render a JSON-serializable snapshot of the whole tree, for the HTTP
    /// status reporter (§11).
    pub fn snapshot(&self) -> StatusSnapshot {
        let nodes = self.inner.lock().unwrap();
        self.snapshot_of(0, &nodes)
    }

    fn snapshot_of(&self, id: NodeId, nodes: &[Node]) -> StatusSnapshot {
        let node = &nodes[id];
        StatusSnapshot {
            name: node.name.clone(),
            status_type: node.status_type,
            status_message: node.status_text.clone(),
            children: node
                .children
                .iter()
                .map(|&child| self.snapshot_of(child, nodes))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub status_type: StatusType,
    pub status_message: String,
    pub children: Vec<StatusSnapshot>,
}

impl StatusHandle {
    /// Register a child node by name, replacing any prior child of that
    /// name ("make or replace", §4.1).
    pub fn make_or_replace_child(&self, name: impl Into<String>, include_parent: bool) -> Self {
        let name = name.into();
        let mut nodes = self.tree.inner.lock().unwrap();
        let child_id = nodes.len();
        nodes.push(Node {
            name: name.clone(),
            parent: Some(self.id),
            include_parent,
            status_type: StatusType::NotStarted,
            status_text: "Not Started".to_string(),
            messages: Vec::new(),
            children: Vec::new(),
        });

        if let Some(existing) = nodes[self.id]
            .children
            .iter()
            .position(|&id| nodes[id].name == name)
        {
            nodes[self.id].children[existing] = child_id;
        } else {
            nodes[self.id].children.push(child_id);
        }

        StatusHandle {
            tree: Arc::clone(&self.tree),
            id: child_id,
        }
    }

    pub fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        let mut nodes = self.tree.inner.lock().unwrap();
        let path = self.tree.full_path(self.id, &nodes);
        nodes[self.id].messages.push(msg.clone());
        (self.tree.sink)(&path, &msg);
    }

    pub fn set_status_text(&self, text: impl Into<String>) {
        let mut nodes = self.tree.inner.lock().unwrap();
        nodes[self.id].status_text = text.into();
    }

    pub fn status_type(&self) -> StatusType {
        self.tree.inner.lock().unwrap()[self.id].status_type
    }

    /// Set `status_type`, applying invariants 4 and 5: terminal states
    /// cascade `Skipped` onto not-yet-started children, and `Success` is
    /// coerced to `ChildrenFailed` if any child is bad. The field is
    /// written exactly once with the final, already-coerced value (§9,
    /// "Status-set atomicity"). A no-op once the node is already in a
    /// terminal state, per invariant 4 ("from a terminal state never
    /// changes").
    pub fn set_status_type(&self, status_type: StatusType) {
        let mut nodes = self.tree.inner.lock().unwrap();

        if nodes[self.id].status_type.is_terminal() {
            return;
        }

        if status_type.is_terminal() {
            let children = nodes[self.id].children.clone();
            for child in children {
                if nodes[child].status_type == StatusType::NotStarted {
                    nodes[child].status_type = StatusType::Skipped;
                    nodes[child].status_text = "Skipped".to_string();
                }
            }
        }

        let final_type = if status_type == StatusType::Success {
            let any_bad = nodes[self.id]
                .children
                .iter()
                .any(|&child| nodes[child].status_type.is_bad());
            if any_bad {
                StatusType::ChildrenFailed
            } else {
                status_type
            }
        } else {
            status_type
        };

        nodes[self.id].status_type = final_type;
    }

    /// `log` + set `status_text` + optionally set `status_type` (§4.1).
    pub fn log_status(&self, msg: impl Into<String>, status_type: Option<StatusType>) {
        let msg = msg.into();
        self.log(msg.clone());
        self.set_status_text(msg);
        if let Some(status_type) = status_type {
            self.set_status_type(status_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_skips_not_started_children() {
        let tree = StatusTree::new("root");
        let root = tree.root();
        let a = root.make_or_replace_child("a", true);
        let _b = root.make_or_replace_child("b", true);
        a.set_status_type(StatusType::Success);
        root.set_status_type(StatusType::Success);

        let snap = tree.snapshot();
        let b = snap.children.iter().find(|c| c.name == "b").unwrap();
        assert_eq!(b.status_type, StatusType::Skipped);
    }

    #[test]
    fn success_coerces_to_children_failed() {
        let tree = StatusTree::new("root");
        let root = tree.root();
        let a = root.make_or_replace_child("a", true);
        a.set_status_type(StatusType::Failed);
        root.set_status_type(StatusType::Success);

        assert_eq!(root.status_type(), StatusType::ChildrenFailed);
    }

    #[test]
    fn make_or_replace_child_replaces_by_name() {
        let tree = StatusTree::new("root");
        let root = tree.root();
        let first = root.make_or_replace_child("img", true);
        first.set_status_type(StatusType::Failed);
        let _second = root.make_or_replace_child("img", true);

        let snap = tree.snapshot();
        assert_eq!(snap.children.len(), 1);
        assert_eq!(snap.children[0].status_type, StatusType::NotStarted);
    }

    #[test]
    fn full_path_respects_include_parent() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_sink = Arc::clone(&seen);
        let tree = StatusTree::with_sink("root", move |path, _msg| {
            seen_for_sink.lock().unwrap().push(path.join(" : "));
        });
        let root = tree.root();
        let pool = root.make_or_replace_child("pool", true);
        let image = pool.make_or_replace_child("image", false);

        image.log("hello");

        assert_eq!(seen.lock().unwrap().last().unwrap(), "image");
    }
}
