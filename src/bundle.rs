//! Bundle normalization: turn the accepted bundle inputs into one canonical,
//! validated shape before anything is compiled.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RenderError, Result};
use crate::manifest::is_js;

/// Entry name given to a bundle supplied as bare source text.
pub const INLINE_ENTRY: &str = "__ssr_bundle__";

const EXPECTED_SHAPE: &str = "should be a string or a bundle object of type:\n\n\
{\n  entry: string;\n  files: Record<string, string>;\n  maps: Record<string, string>;\n}\n";

/// The forms a caller can hand a bundle over in.
#[derive(Debug, Clone)]
pub enum BundleSource {
    /// Source text of a single self-contained module.
    Code(String),
    /// An already-parsed bundle object.
    Object(Value),
    /// A `.json` bundle or `.js` module on disk.
    Path(PathBuf),
}

impl From<String> for BundleSource {
    /// Absolute paths ending in `.js`/`.json` are read from disk, anything
    /// else is treated as inline source.
    fn from(text: String) -> Self {
        let path = Path::new(&text);
        let looks_like_file = text.ends_with(".js") || text.ends_with(".json");
        if looks_like_file && path.is_absolute() {
            Self::Path(PathBuf::from(text))
        } else {
            Self::Code(text)
        }
    }
}

impl From<&str> for BundleSource {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

impl From<PathBuf> for BundleSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Value> for BundleSource {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}

impl From<RawBundle> for BundleSource {
    fn from(raw: RawBundle) -> Self {
        // RawBundle only holds strings and JSON values
        Self::Object(serde_json::to_value(raw).unwrap_or_default())
    }
}

/// Wire format of a server bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBundle {
    pub entry: String,
    pub files: IndexMap<String, String>,
    #[serde(default)]
    pub maps: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basedir: Option<PathBuf>,
}

/// A validated bundle: `entry` is always a key of a non-empty `files`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub entry: String,
    pub files: IndexMap<String, String>,
    pub basedir: Option<PathBuf>,
    /// Raw source maps keyed by the bundled file they describe.
    pub maps: IndexMap<String, Value>,
}

impl Bundle {
    /// Normalize `source`. An explicit `basedir` wins over the directory of a
    /// bundle file, which wins over the bundle object's own `basedir`.
    pub fn load(source: impl Into<BundleSource>, basedir: Option<PathBuf>) -> Result<Self> {
        match source.into() {
            BundleSource::Code(code) => Self::from_code(code, basedir),
            BundleSource::Object(value) => Self::from_value(value, basedir),
            BundleSource::Path(path) => Self::from_path(&path, basedir),
        }
    }

    fn from_code(code: String, basedir: Option<PathBuf>) -> Result<Self> {
        let mut files = IndexMap::new();
        files.insert(INLINE_ENTRY.to_string(), code);
        Ok(Self {
            entry: INLINE_ENTRY.to_string(),
            files,
            basedir,
            maps: IndexMap::new(),
        })
    }

    fn from_path(path: &Path, basedir: Option<PathBuf>) -> Result<Self> {
        if !path.exists() {
            return Err(RenderError::invalid_bundle(format!(
                "cannot locate bundle file: {}",
                path.display()
            )));
        }
        let basedir = basedir.or_else(|| path.parent().map(Path::to_path_buf));
        let text = std::fs::read_to_string(path).map_err(|e| {
            RenderError::invalid_bundle(format!(
                "cannot read bundle file: {} ({e})",
                path.display()
            ))
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            let value: Value = serde_json::from_str(&text).map_err(|e| {
                RenderError::invalid_bundle(format!(
                    "invalid JSON bundle file: {} ({e})",
                    path.display()
                ))
            })?;
            match value {
                Value::String(code) => Self::from_code(code, basedir),
                other => Self::from_value(other, basedir),
            }
        } else {
            Self::from_code(text, basedir)
        }
    }

    fn from_value(value: Value, basedir: Option<PathBuf>) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(RenderError::invalid_bundle(EXPECTED_SHAPE));
        };

        let entry = match object.remove("entry") {
            Some(Value::String(entry)) => entry,
            _ => {
                return Err(RenderError::invalid_bundle(format!(
                    "missing string field `entry`, {EXPECTED_SHAPE}"
                )))
            }
        };

        let files = match object.remove("files") {
            Some(Value::Object(files)) => files
                .into_iter()
                .map(|(name, source)| match source {
                    Value::String(source) => Ok((name, source)),
                    _ => Err(RenderError::invalid_bundle(format!(
                        "file '{name}' must map to source text, {EXPECTED_SHAPE}"
                    ))),
                })
                .collect::<Result<IndexMap<_, _>>>()?,
            _ => {
                return Err(RenderError::invalid_bundle(format!(
                    "missing object field `files`, {EXPECTED_SHAPE}"
                )))
            }
        };

        if files.is_empty() {
            return Err(RenderError::invalid_bundle("bundle `files` is empty"));
        }
        if !files.contains_key(&entry) {
            return Err(RenderError::invalid_bundle(format!(
                "entry '{entry}' is not one of the bundle files"
            )));
        }

        let maps = match object.remove("maps") {
            Some(Value::Object(maps)) => maps.into_iter().collect(),
            Some(Value::Null) | None => IndexMap::new(),
            Some(_) => {
                return Err(RenderError::invalid_bundle(format!(
                    "`maps` must be an object, {EXPECTED_SHAPE}"
                )))
            }
        };

        let own_basedir = match object.remove("basedir") {
            Some(Value::String(dir)) => Some(PathBuf::from(dir)),
            _ => None,
        };

        Ok(Self {
            entry,
            files,
            basedir: basedir.or(own_basedir),
            maps,
        })
    }
}

/// Assembles a server bundle from the assets a build emitted.
pub struct ServerBundle;

impl ServerBundle {
    /// `entry_assets` are the assets of the server entrypoint; `assets` are
    /// every emitted `(name, source)` pair. `.js` assets become bundle files,
    /// `.js.map` assets become source maps keyed by the file they map.
    pub fn from_assets<I>(entry_name: &str, entry_assets: &[String], assets: I) -> Result<RawBundle>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let js_entries: Vec<&String> = entry_assets.iter().filter(|a| is_js(a)).collect();
        let entry = match js_entries.as_slice() {
            [] => {
                return Err(RenderError::MissingServerEntry {
                    entry: entry_name.to_string(),
                })
            }
            [entry] => (*entry).clone(),
            many => {
                return Err(RenderError::MultipleServerEntries {
                    assets: many.iter().map(|a| a.to_string()).collect(),
                })
            }
        };

        let mut bundle = RawBundle {
            entry,
            ..Default::default()
        };
        for (name, source) in assets {
            if name.ends_with(".js") {
                bundle.files.insert(name, source);
            } else if let Some(mapped) = name.strip_suffix(".map").filter(|n| n.ends_with(".js")) {
                let map = serde_json::from_str(&source).map_err(|e| {
                    RenderError::invalid_bundle(format!("invalid source map '{name}': {e}"))
                })?;
                bundle.maps.insert(mapped.to_string(), map);
            }
            // nothing else belongs in a server bundle
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_inline_code_becomes_single_file_bundle() {
        let bundle = Bundle::load("module.exports = 1", None).unwrap();
        assert_eq!(bundle.entry, INLINE_ENTRY);
        assert_eq!(bundle.files[INLINE_ENTRY], "module.exports = 1");
        assert!(bundle.maps.is_empty());
    }

    #[test]
    fn test_object_bundle() {
        let bundle = Bundle::load(
            json!({
                "entry": "main.js",
                "files": { "main.js": "module.exports = 1" },
                "maps": { "main.js": { "version": 3 } },
                "basedir": "/srv/app"
            }),
            None,
        )
        .unwrap();
        assert_eq!(bundle.entry, "main.js");
        assert_eq!(bundle.basedir, Some(PathBuf::from("/srv/app")));
        assert!(bundle.maps.contains_key("main.js"));
    }

    #[test]
    fn test_explicit_basedir_wins() {
        let bundle = Bundle::load(
            json!({ "entry": "a.js", "files": { "a.js": "" }, "basedir": "/own" }),
            Some(PathBuf::from("/explicit")),
        )
        .unwrap();
        assert_eq!(bundle.basedir, Some(PathBuf::from("/explicit")));
    }

    #[test]
    fn test_entry_must_be_a_file() {
        let err = Bundle::load(
            json!({ "entry": "missing.js", "files": { "a.js": "" } }),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::InvalidBundleFormat { .. }));
        assert!(err.to_string().contains("missing.js"));
    }

    #[test]
    fn test_malformed_object_names_the_field() {
        let err = Bundle::load(json!({ "entry": 1, "files": {} }), None).unwrap_err();
        assert!(err.to_string().contains("`entry`"));

        let err = Bundle::load(json!({ "entry": "a.js" }), None).unwrap_err();
        assert!(err.to_string().contains("`files`"));
        assert!(err.to_string().contains("entry: string"));

        let err = Bundle::load(json!([1, 2]), None).unwrap_err();
        assert!(matches!(err, RenderError::InvalidBundleFormat { .. }));
    }

    #[test]
    fn test_json_file_sets_basedir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server-bundle.json");
        fs::write(
            &path,
            r#"{"entry":"main.js","files":{"main.js":"module.exports = 1"}}"#,
        )
        .unwrap();

        let bundle = Bundle::load(path.clone(), None).unwrap();
        assert_eq!(bundle.basedir.as_deref(), Some(dir.path()));

        // string form of an absolute path is read from disk too
        let bundle = Bundle::load(path.to_string_lossy().to_string(), None).unwrap();
        assert_eq!(bundle.entry, "main.js");
    }

    #[test]
    fn test_invalid_json_file_is_named() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ nope").unwrap();

        let err = Bundle::load(path, None).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_unreadable_file_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.json");
        fs::create_dir(&path).unwrap();

        let err = Bundle::load(path, None).unwrap_err();
        assert!(matches!(err, RenderError::InvalidBundleFormat { .. }), "{err}");
        assert!(err.to_string().contains("cannot read bundle file"));
    }

    #[test]
    fn test_missing_file() {
        let err = Bundle::load(PathBuf::from("/definitely/not/here.json"), None).unwrap_err();
        assert!(err.to_string().contains("cannot locate bundle file"));
    }

    #[test]
    fn test_js_file_is_inline_bundle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry.js");
        fs::write(&path, "module.exports = 2").unwrap();

        let bundle = Bundle::load(path, None).unwrap();
        assert_eq!(bundle.files[INLINE_ENTRY], "module.exports = 2");
        assert_eq!(bundle.basedir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_server_bundle_from_assets() {
        let assets = vec![
            ("main.js".to_string(), "module.exports = 1".to_string()),
            ("0.js".to_string(), "exports.x = 1".to_string()),
            ("main.js.map".to_string(), r#"{"version":3}"#.to_string()),
            ("style.css".to_string(), "a{}".to_string()),
        ];
        let raw = ServerBundle::from_assets("app", &["main.js".into()], assets).unwrap();
        assert_eq!(raw.entry, "main.js");
        assert_eq!(raw.files.len(), 2);
        assert_eq!(raw.maps["main.js"], json!({ "version": 3 }));

        let bundle = Bundle::load(raw, None).unwrap();
        assert_eq!(bundle.entry, "main.js");
    }

    #[test]
    fn test_server_bundle_entry_errors() {
        let err = ServerBundle::from_assets("app", &["a.css".into()], Vec::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingServerEntry { .. }));

        let err = ServerBundle::from_assets("app", &["a.js".into(), "b.js".into()], Vec::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::MultipleServerEntries { .. }));
    }
}
