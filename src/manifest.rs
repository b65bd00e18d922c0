//! Client build manifest and the mapping from server-rendered component ids to
//! the async client files they need.

use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RenderError, Result};

static JS_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.js(\?[^.]+)?$").unwrap());
static CSS_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.css(\?[^.]+)?$").unwrap());
static JS_ASSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.js(?:$|\?)").unwrap());
static IMAGE_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"jpe?g|png|svg|gif|webp|ico").unwrap());
static FONT_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"woff2?|ttf|otf|eot").unwrap());
static APPENDED_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s\w+$").unwrap());

pub fn is_js(file: &str) -> bool {
    JS_FILE.is_match(file)
}

pub fn is_css(file: &str) -> bool {
    CSS_FILE.is_match(file)
}

/// Build-time metadata about the client bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientManifest {
    #[serde(default)]
    pub public_path: String,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub initial: Vec<String>,
    #[serde(default, rename = "async")]
    pub async_files: Vec<String>,
    /// Hashed module id -> indices into `all`.
    #[serde(default)]
    pub modules: IndexMap<String, Vec<usize>>,
}

impl ClientManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RenderError::Runtime(format!("invalid client manifest: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|error| RenderError::Io {
            path: PathBuf::from(path),
            error,
        })?;
        Self::from_json(&json)
    }

    /// Build the manifest from the client build's stats.
    ///
    /// Every emitted asset lands in `all`. JS and CSS assets of the
    /// entrypoints are `initial`, the remaining JS and CSS assets are
    /// `async`. Each module found in exactly one chunk maps to that chunk's
    /// files plus the assets of modules in the same chunk.
    pub fn from_build_stats(stats: &BuildStats) -> Self {
        let all: Vec<String> = stats
            .assets
            .iter()
            .map(|asset| asset.name().to_string())
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        let initial: Vec<String> = stats
            .entrypoints
            .values()
            .flat_map(|entry| entry.assets.iter().map(AssetRef::name))
            .filter(|file| is_js(file) || is_css(file))
            .map(str::to_string)
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        let async_files = all
            .iter()
            .filter(|file| (is_js(file) || is_css(file)) && !initial.contains(*file))
            .cloned()
            .collect();

        let index_of = |file: &String| all.iter().position(|f| f == file);
        let asset_modules: Vec<&ModuleStats> =
            stats.modules.iter().filter(|m| !m.assets.is_empty()).collect();

        let mut modules = IndexMap::new();
        for module in &stats.modules {
            // modules duplicated in several chunks are ambiguous
            let [chunk_id] = module.chunks.as_slice() else {
                continue;
            };
            let Some(chunk) = stats.chunks.iter().find(|c| &c.id == chunk_id) else {
                continue;
            };
            let mut files: Vec<usize> = chunk.files.iter().filter_map(index_of).collect();
            for asset_module in &asset_modules {
                if asset_module.chunks.contains(chunk_id) {
                    files.extend(asset_module.assets.iter().filter_map(index_of));
                }
            }
            let identifier = APPENDED_HASH.replace(&module.identifier, "");
            modules.insert(module_id(&identifier), files);
        }

        Self {
            public_path: stats.public_path.clone(),
            all,
            initial,
            async_files,
            modules,
        }
    }
}

/// The parts of a client build's stats the manifest is built from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildStats {
    pub public_path: String,
    pub assets: Vec<AssetRef>,
    pub entrypoints: IndexMap<String, EntrypointStats>,
    pub chunks: Vec<ChunkStats>,
    pub modules: Vec<ModuleStats>,
}

/// An asset named either by a bare string or by an object with a `name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AssetRef {
    Name(String),
    Object { name: String },
}

impl AssetRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Object { name } => name,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntrypointStats {
    pub assets: Vec<AssetRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkStats {
    /// Numeric or string chunk id.
    pub id: Value,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModuleStats {
    pub identifier: String,
    pub chunks: Vec<Value>,
    pub assets: Vec<String>,
}

/// Short stable id of a module identifier, as the build hashes it: the
/// `hash-sum` fold over the UTF-16 units, zero-padded hex.
pub fn module_id(identifier: &str) -> String {
    let mut hash = fold(0, "");
    hash = fold(hash, "[object String]");
    hash = fold(hash, "string");
    hash = fold(hash, identifier);
    format!("{:08x}", hash)
}

fn fold(hash: i64, text: &str) -> i64 {
    if text.is_empty() {
        return hash;
    }
    let mut hash = hash;
    for unit in text.encode_utf16() {
        let shifted = (hash as i32).wrapping_shl(5) as i64;
        hash = (shifted - hash + unit as i64) as i32 as i64;
    }
    if hash < 0 {
        hash * -2
    } else {
        hash
    }
}

/// A manifest file classified for resource hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub file: String,
    pub extension: String,
    pub file_without_query: String,
    /// Value for the `as` attribute of a preload link, empty if unknown.
    pub as_type: &'static str,
}

impl Resource {
    pub fn new(file: &str) -> Self {
        let without_query = match file.find('?') {
            Some(index) => &file[..index],
            None => file,
        };
        let extension = Path::new(without_query)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            file: file.to_string(),
            as_type: preload_type(&extension),
            extension,
            file_without_query: without_query.to_string(),
        }
    }
}

fn preload_type(extension: &str) -> &'static str {
    match extension {
        "js" => "script",
        "css" => "style",
        ext if IMAGE_EXT.is_match(ext) => "image",
        ext if FONT_EXT.is_match(ext) => "font",
        // not exhaustive, covers the common cases
        _ => "",
    }
}

/// Maps component ids registered during a render to client files.
#[derive(Debug, Clone, Default)]
pub struct AsyncFileMapper {
    map: IndexMap<String, Vec<String>>,
}

impl AsyncFileMapper {
    pub fn new(manifest: &ClientManifest) -> Self {
        let async_files: IndexSet<&str> =
            manifest.async_files.iter().map(String::as_str).collect();
        let map = manifest
            .modules
            .iter()
            .map(|(id, indices)| {
                let files = indices
                    .iter()
                    .filter_map(|&index| manifest.all.get(index))
                    // only async files or non-js assets; initial scripts load anyway
                    .filter(|file| async_files.contains(file.as_str()) || !JS_ASSET.is_match(file))
                    .cloned()
                    .collect();
                (id.clone(), files)
            })
            .collect();
        Self { map }
    }

    /// Deduplicated union of files for `ids`, in first-seen order.
    pub fn map<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut files = IndexSet::new();
        for id in ids {
            if let Some(mapped) = self.map.get(id) {
                files.extend(mapped.iter().cloned());
            }
        }
        files.into_iter().collect()
    }
}
