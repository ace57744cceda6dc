//! Provisioning container model
//!
//! A container is a JSON document with four required fields:
//!
//! - `directory_tree`: parent id → ordered list of `{id, name}` children
//! - `name_lookup` (alias `uuid_dirname_mapping`): node id → directory name
//! - `platform_scripts`: platform key → row in `scripts`
//! - `scripts`: ordered script cells, `null` for an empty cell
//!
//! The three metadata maps may also be given as JSON-encoded strings, and
//! platform keys may use the legacy `win_script` style with string row
//! numbers. A [`ContainerDocument`] is the wire form. A [`Container`] is
//! the validated, immutable model the rest of the run consumes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{ProvisionError, Result};
use crate::platform::PlatformKey;
use crate::tree;

/// Parent identifier standing for the operator-chosen target root.
pub const DEFAULT_ROOT_ID: &str = "root";

/// One entry in a parent's child list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: String,
    /// Informational; the name lookup is authoritative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChildRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Row number, as an integer or a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowIndex {
    Number(u64),
    Text(String),
}

impl RowIndex {
    fn to_row(&self) -> Option<usize> {
        match self {
            RowIndex::Number(n) => usize::try_from(*n).ok(),
            RowIndex::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Variant of the bootstrap the container describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Flavor {
    #[default]
    Standard,
    /// Mounts a remote filesystem onto an existing, empty mount point
    #[serde(alias = "ofs")]
    ObjectiveFs,
}

/// What the bootstrap script needs from the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub needs_credentials: bool,
    #[serde(default)]
    pub needs_symlink: bool,
}

/// The single well-known symlink some bootstraps need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkSpec {
    /// Link location, relative to the target root
    pub name: PathBuf,
    /// What the link points at, stored verbatim
    pub target: PathBuf,
}

/// Wire form of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDocument {
    #[serde(default = "default_root_id")]
    pub root_id: String,

    #[serde(deserialize_with = "embedded_json")]
    pub directory_tree: BTreeMap<String, Vec<ChildRecord>>,

    #[serde(alias = "uuid_dirname_mapping", deserialize_with = "embedded_json")]
    pub name_lookup: BTreeMap<String, String>,

    #[serde(deserialize_with = "embedded_json")]
    pub platform_scripts: BTreeMap<String, RowIndex>,

    pub scripts: Vec<Option<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,

    #[serde(default)]
    pub flavor: Flavor,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<SymlinkSpec>,
}

impl Default for ContainerDocument {
    fn default() -> Self {
        Self {
            root_id: default_root_id(),
            directory_tree: BTreeMap::new(),
            name_lookup: BTreeMap::new(),
            platform_scripts: BTreeMap::new(),
            scripts: Vec::new(),
            capabilities: None,
            flavor: Flavor::Standard,
            symlink: None,
        }
    }
}

fn default_root_id() -> String {
    DEFAULT_ROOT_ID.to_string()
}

/// Accept either the value itself or a string holding its JSON encoding.
fn embedded_json<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => {
            serde_json::from_str(&text).map_err(serde::de::Error::custom)
        }
        value => serde_json::from_value(value).map_err(serde::de::Error::custom),
    }
}

/// Validated, immutable container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    root_id: String,
    directory_tree: BTreeMap<String, Vec<ChildRecord>>,
    name_lookup: BTreeMap<String, String>,
    platform_scripts: BTreeMap<PlatformKey, usize>,
    scripts: Vec<Option<String>>,
    capabilities: Option<Capabilities>,
    flavor: Flavor,
    symlink: Option<SymlinkSpec>,
}

impl Container {
    /// Load and validate a container from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ProvisionError::corrupt(format!("cannot read container {:?}: {}", path, e))
        })?;

        let container = Self::from_json_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            parents = container.directory_tree.len(),
            names = container.name_lookup.len(),
            scripts = container.scripts.len(),
            "Container loaded"
        );
        Ok(container)
    }

    /// Parse and validate a container from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: ContainerDocument = serde_json::from_str(json)
            .map_err(|e| ProvisionError::corrupt(format!("invalid container JSON: {}", e)))?;
        Self::try_from(document)
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn directory_tree(&self) -> &BTreeMap<String, Vec<ChildRecord>> {
        &self.directory_tree
    }

    pub fn children_of(&self, id: &str) -> &[ChildRecord] {
        self.directory_tree.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.name_lookup.get(id).map(String::as_str)
    }

    pub fn script_row(&self, platform: PlatformKey) -> Option<usize> {
        self.platform_scripts.get(&platform).copied()
    }

    pub fn scripts(&self) -> &[Option<String>] {
        &self.scripts
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// The symlink to create, when the container asks for one.
    pub fn symlink(&self) -> Option<&SymlinkSpec> {
        match self.capabilities {
            Some(caps) if caps.needs_symlink => self.symlink.as_ref(),
            _ => None,
        }
    }
}

impl TryFrom<ContainerDocument> for Container {
    type Error = ProvisionError;

    fn try_from(document: ContainerDocument) -> Result<Self> {
        if document.root_id.is_empty() {
            return Err(ProvisionError::corrupt("root_id must not be empty"));
        }

        let mut platform_scripts = BTreeMap::new();
        for (key, row) in &document.platform_scripts {
            let platform = PlatformKey::from_index_key(key).ok_or_else(|| {
                ProvisionError::corrupt(format!("unknown platform key {:?} in platform_scripts", key))
            })?;
            let row = row.to_row().ok_or_else(|| {
                ProvisionError::corrupt(format!("platform {:?} has an invalid row index {:?}", key, row))
            })?;
            if platform_scripts.insert(platform, row).is_some() {
                return Err(ProvisionError::corrupt(format!(
                    "platform {} is listed more than once in platform_scripts",
                    platform
                )));
            }
        }

        if let Some(caps) = document.capabilities {
            if caps.needs_symlink && document.symlink.is_none() {
                return Err(ProvisionError::corrupt(
                    "needs_symlink is set but no symlink is described",
                ));
            }
        }
        if let Some(symlink) = &document.symlink {
            validate_symlink_name(&symlink.name)?;
        }

        tree::validate_structure(&document.root_id, &document.directory_tree)?;

        Ok(Self {
            root_id: document.root_id,
            directory_tree: document.directory_tree,
            name_lookup: document.name_lookup,
            platform_scripts,
            scripts: document.scripts,
            capabilities: document.capabilities,
            flavor: document.flavor,
            symlink: document.symlink,
        })
    }
}

fn validate_symlink_name(name: &Path) -> Result<()> {
    if name.as_os_str().is_empty() {
        return Err(ProvisionError::corrupt("symlink name must not be empty"));
    }
    for component in name.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ProvisionError::corrupt(format!(
                    "symlink name {:?} must stay inside the target root",
                    name
                )));
            }
        }
    }
    Ok(())
}
