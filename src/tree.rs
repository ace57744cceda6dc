//! Directory tree planning
//!
//! The container stores the tree flat, as parent → children lists. This
//! module turns it into an explicit plan once: structural problems (a node
//! with two parents, the virtual root listed as a child, a cycle) are
//! rejected up front. The reachable part of the tree is then walked
//! breadth-first from the virtual root in child-listing order. Every planned
//! directory knows its parent's index in the plan, so parents always come
//! before their children.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::container::{ChildRecord, Container};
use crate::error::{ProvisionError, Result};

/// How to treat branches that cannot be named or reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strictness {
    /// Skip the branch and record a diagnostic
    #[default]
    Tolerant,
    /// Reject the container
    Strict,
}

/// One directory to create, relative to the target root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDir {
    pub id: String,
    pub name: String,
    /// Index of the parent in the plan; `None` for children of the root
    pub parent: Option<usize>,
    pub relative_path: PathBuf,
    pub depth: usize,
}

/// A branch of the container that was left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeDiagnostic {
    /// The node has no entry in the name lookup
    MissingName {
        id: String,
        parent: String,
        skipped_descendants: usize,
    },
    /// The parent id is never listed as anyone's child
    Unreachable { parent: String, children: usize },
}

impl fmt::Display for TreeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingName {
                id,
                parent,
                skipped_descendants,
            } => write!(
                f,
                "node {} under {} has no name; skipped it and {} descendant(s)",
                id, parent, skipped_descendants
            ),
            Self::Unreachable { parent, children } => write!(
                f,
                "parent {} is not reachable from the root; skipped {} child(ren)",
                parent, children
            ),
        }
    }
}

/// Breadth-first directory plan for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryPlan {
    nodes: Vec<PlannedDir>,
    diagnostics: Vec<TreeDiagnostic>,
}

impl DirectoryPlan {
    /// Walk the container's tree from its virtual root.
    ///
    /// # Errors
    ///
    /// `CorruptContainer` in strict mode when a branch is unnamed or
    /// unreachable.
    pub fn build(container: &Container, strictness: Strictness) -> Result<Self> {
        let root_id = container.root_id();
        let mut nodes: Vec<PlannedDir> = Vec::new();
        let mut diagnostics = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut skipped: HashSet<&str> = HashSet::new();

        let mut queue: VecDeque<(&str, Option<usize>)> = VecDeque::new();
        queue.push_back((root_id, None));

        while let Some((parent_id, parent_index)) = queue.pop_front() {
            visited.insert(parent_id);

            for child in container.children_of(parent_id) {
                let Some(name) = container.name_of(&child.id) else {
                    let descendants = descendants_of(container, &child.id);
                    let diagnostic = TreeDiagnostic::MissingName {
                        id: child.id.clone(),
                        parent: parent_id.to_string(),
                        skipped_descendants: descendants.len(),
                    };
                    if strictness == Strictness::Strict {
                        return Err(ProvisionError::corrupt(diagnostic.to_string()));
                    }
                    tracing::warn!("{}", diagnostic);
                    skipped.insert(child.id.as_str());
                    skipped.extend(descendants);
                    diagnostics.push(diagnostic);
                    continue;
                };

                if let Some(listed) = child.name.as_deref() {
                    if listed != name {
                        tracing::debug!(id = %child.id, listed, lookup = name, "Child record name differs from lookup");
                    }
                }

                let (relative_path, depth) = match parent_index {
                    Some(p) => (nodes[p].relative_path.join(name), nodes[p].depth + 1),
                    None => (PathBuf::from(name), 0),
                };
                nodes.push(PlannedDir {
                    id: child.id.clone(),
                    name: name.to_string(),
                    parent: parent_index,
                    relative_path,
                    depth,
                });
                queue.push_back((child.id.as_str(), Some(nodes.len() - 1)));
            }
        }

        for (parent, children) in container.directory_tree() {
            let parent = parent.as_str();
            if visited.contains(parent) || skipped.contains(parent) || children.is_empty() {
                continue;
            }
            let diagnostic = TreeDiagnostic::Unreachable {
                parent: parent.to_string(),
                children: children.len(),
            };
            if strictness == Strictness::Strict {
                return Err(ProvisionError::corrupt(diagnostic.to_string()));
            }
            tracing::warn!("{}", diagnostic);
            diagnostics.push(diagnostic);
        }

        Ok(Self { nodes, diagnostics })
    }

    pub fn nodes(&self) -> &[PlannedDir] {
        &self.nodes
    }

    pub fn diagnostics(&self) -> &[TreeDiagnostic] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Render the plan as an indented tree under `root_label`.
    pub fn render_preview(&self, root_label: &str) -> String {
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        let mut top_level = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            match node.parent {
                Some(parent) => children[parent].push(index),
                None => top_level.push(index),
            }
        }

        let mut out = String::from(root_label);
        out.push('\n');
        self.render_level(&top_level, &children, "", &mut out);
        out
    }

    fn render_level(&self, level: &[usize], children: &[Vec<usize>], prefix: &str, out: &mut String) {
        for (position, &index) in level.iter().enumerate() {
            let last = position + 1 == level.len();
            out.push_str(prefix);
            out.push_str(if last { "└── " } else { "├── " });
            out.push_str(&self.nodes[index].name);
            out.push('\n');

            let nested = format!("{}{}", prefix, if last { "    " } else { "│   " });
            self.render_level(&children[index], children, &nested, out);
        }
    }
}

/// Every id below `id`; the tree is known to be acyclic.
fn descendants_of<'a>(container: &'a Container, id: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut stack: Vec<&'a str> = container
        .children_of(id)
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    while let Some(next) = stack.pop() {
        found.push(next);
        stack.extend(container.children_of(next).iter().map(|c| c.id.as_str()));
    }
    found
}

/// Reject trees that are not rooted trees.
///
/// The virtual root must never be listed as a child, no id may be listed
/// twice, and following parents upward must never loop.
pub fn validate_structure(root_id: &str, tree: &BTreeMap<String, Vec<ChildRecord>>) -> Result<()> {
    let mut parent_of: HashMap<&str, &str> = HashMap::new();

    for (parent, children) in tree {
        for child in children {
            if child.id == root_id {
                return Err(ProvisionError::corrupt(format!(
                    "the root {:?} is listed as a child of {:?}",
                    root_id, parent
                )));
            }
            if let Some(previous) = parent_of.insert(child.id.as_str(), parent.as_str()) {
                return Err(ProvisionError::corrupt(format!(
                    "node {:?} is listed under both {:?} and {:?}",
                    child.id, previous, parent
                )));
            }
        }
    }

    // Each id reaches the top of its chain once; `done` ids are known acyclic.
    let mut done: HashSet<&str> = HashSet::new();
    for &start in parent_of.keys() {
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut current = start;
        loop {
            if done.contains(current) {
                break;
            }
            if !on_path.insert(current) {
                return Err(ProvisionError::corrupt(format!(
                    "directory tree contains a cycle through {:?}",
                    current
                )));
            }
            path.push(current);
            match parent_of.get(current) {
                Some(&parent) => current = parent,
                None => break,
            }
        }
        done.extend(path);
    }

    Ok(())
}
