//! Property-Based Tests for Provision
//!
//! Uses proptest for testing invariants:
//! - Reconstructed trees match a recursive reference walk
//! - Reconstruction is idempotent
//! - Substitution is single-pass and order independent
//! - Platform mapping ignores case and rejects everything else

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use provision::container::Container;
use provision::platform::{self, PlatformKey};
use provision::reconstruct::reconstruct;
use provision::substitution::{Substitutions, Token, substitute};
use provision::tree::{DirectoryPlan, Strictness};
use provision::ProvisionError;
use serde_json::{Map, Value, json};
use tempfile::TempDir;

// =============================================================================
// Random trees
// =============================================================================

/// One generated node: (parent choice, has a name).
type NodeSpec = (prop::sample::Index, bool);

fn tree_strategy() -> impl Strategy<Value = Vec<NodeSpec>> {
    prop::collection::vec((any::<prop::sample::Index>(), prop::bool::weighted(0.85)), 1..16)
}

fn node_id(index: usize) -> String {
    format!("n{}", index)
}

/// Parent id of node `i`: the root or any earlier node.
fn parent_of(i: usize, choice: &prop::sample::Index) -> String {
    match choice.index(i + 1) {
        0 => "root".to_string(),
        k => node_id(k - 1),
    }
}

fn container_json(nodes: &[NodeSpec]) -> Value {
    let mut tree: Map<String, Value> = Map::new();
    let mut names: Map<String, Value> = Map::new();

    for (i, (choice, named)) in nodes.iter().enumerate() {
        let parent = parent_of(i, choice);
        let entry = tree.entry(parent).or_insert_with(|| json!([]));
        if let Value::Array(children) = entry {
            children.push(json!({"id": node_id(i)}));
        }
        if *named {
            names.insert(node_id(i), json!(format!("dir{}", i)));
        }
    }

    json!({
        "directory_tree": tree,
        "name_lookup": names,
        "platform_scripts": {},
        "scripts": []
    })
}

/// Paths an independent recursive walk expects to exist.
fn reference_paths(nodes: &[NodeSpec]) -> BTreeSet<PathBuf> {
    fn walk(nodes: &[NodeSpec], parent: &str, prefix: &Path, out: &mut BTreeSet<PathBuf>) {
        for (i, (choice, named)) in nodes.iter().enumerate() {
            if parent_of(i, choice) != parent || !named {
                continue;
            }
            let path = prefix.join(format!("dir{}", i));
            out.insert(path.clone());
            walk(nodes, &node_id(i), &path, out);
        }
    }

    let mut out = BTreeSet::new();
    walk(nodes, "root", Path::new(""), &mut out);
    out
}

fn paths_on_disk(root: &Path) -> BTreeSet<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeSet<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.insert(path.strip_prefix(root).unwrap().to_path_buf());
                walk(root, &path, out);
            }
        }
    }

    let mut out = BTreeSet::new();
    walk(root, root, &mut out);
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The created set equals the reference walk, skipped branches included.
    #[test]
    fn reconstruction_matches_reference(nodes in tree_strategy()) {
        let container = Container::from_json_str(&container_json(&nodes).to_string()).unwrap();
        let plan = DirectoryPlan::build(&container, Strictness::Tolerant).unwrap();
        let dir = TempDir::new().unwrap();

        let report = reconstruct(&plan, dir.path(), None).unwrap();
        let expected = reference_paths(&nodes);

        prop_assert!(report.failures.is_empty());
        prop_assert_eq!(report.created, expected.len());
        prop_assert_eq!(paths_on_disk(dir.path()), expected);
    }

    /// A second run creates nothing and finds everything.
    #[test]
    fn reconstruction_is_idempotent(nodes in tree_strategy()) {
        let container = Container::from_json_str(&container_json(&nodes).to_string()).unwrap();
        let plan = DirectoryPlan::build(&container, Strictness::Tolerant).unwrap();
        let dir = TempDir::new().unwrap();

        let first = reconstruct(&plan, dir.path(), None).unwrap();
        let second = reconstruct(&plan, dir.path(), None).unwrap();

        prop_assert_eq!(second.created, 0);
        prop_assert_eq!(second.already_present, first.reconstructed());
    }

    /// Strict mode accepts exactly the fully named trees.
    #[test]
    fn strict_mode_rejects_unnamed_branches(nodes in tree_strategy()) {
        let container = Container::from_json_str(&container_json(&nodes).to_string()).unwrap();
        let all_named = nodes.iter().all(|(_, named)| *named);

        let result = DirectoryPlan::build(&container, Strictness::Strict);
        prop_assert_eq!(result.is_ok(), all_named);
    }
}

// =============================================================================
// Substitution
// =============================================================================

/// Values drawn from an alphabet that can spell every token literal.
fn value_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Z ]{0,12}",
        Just("MNTPOINT".to_string()),
        Just("UNAME".to_string()),
        Just("PSSWD".to_string()),
    ]
}

proptest! {
    /// Inserted values are never rescanned, whatever they contain.
    #[test]
    fn substitution_is_single_pass(
        uname in value_strategy(),
        psswd in value_strategy(),
        mntpoint in value_strategy(),
    ) {
        let subs = Substitutions::new()
            .with_value(Token::Uname, uname.clone())
            .with_value(Token::Psswd, psswd.clone())
            .with_value(Token::Mntpoint, mntpoint.clone());

        let out = substitute("UNAME|PSSWD|MNTPOINT", &subs).unwrap();
        prop_assert_eq!(out, format!("{}|{}|{}", uname, psswd, mntpoint));
    }

    /// Any template naming an unbound token fails and names it.
    #[test]
    fn unbound_token_is_template_error(
        prefix in "[a-z0-9 ]{0,10}",
        suffix in "[a-z0-9 ]{0,10}",
    ) {
        let subs = Substitutions::new().with_value(Token::Mntpoint, "/mnt");
        let template = format!("{}PSSWD{}", prefix, suffix);

        match substitute(&template, &subs) {
            Err(ProvisionError::Template { unresolved }) => {
                prop_assert_eq!(unresolved, vec![Token::Psswd]);
            }
            other => prop_assert!(false, "expected Template error, got {:?}", other),
        }
    }

    /// Text without token literals passes through unchanged.
    #[test]
    fn plain_text_is_unchanged(text in "[a-z0-9 \\n]{0,40}") {
        let out = substitute(&text, &Substitutions::new()).unwrap();
        prop_assert_eq!(out, text);
    }
}

// =============================================================================
// Platform mapping
// =============================================================================

fn mixed_case(word: &'static str) -> impl Strategy<Value = String> {
    prop::collection::vec(any::<bool>(), word.len()).prop_map(move |upper| {
        word.chars()
            .zip(upper)
            .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
            .collect()
    })
}

proptest! {
    #[test]
    fn platform_mapping_ignores_case(
        (identity, expected) in prop_oneof![
            mixed_case("windows").prop_map(|s| (s, PlatformKey::Win)),
            mixed_case("darwin").prop_map(|s| (s, PlatformKey::Darwin)),
            mixed_case("linux").prop_map(|s| (s, PlatformKey::Linux)),
        ]
    ) {
        prop_assert_eq!(platform::resolve(&identity).unwrap(), expected);
    }

    #[test]
    fn other_identities_are_unsupported(identity in "[A-Za-z0-9 ]{0,12}") {
        let known = ["windows", "darwin", "linux"];
        prop_assume!(!known.contains(&identity.to_ascii_lowercase().as_str()));

        let is_unsupported = matches!(
            platform::resolve(&identity),
            Err(ProvisionError::UnsupportedPlatform { .. })
        );
        prop_assert!(is_unsupported);
    }
}
