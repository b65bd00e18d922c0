//! `require` resolution for sandboxed bundle code.
//!
//! Requests first resolve against the bundle's virtual files. Anything else
//! is an external package, resolved Node-style relative to `basedir`.
//! Blocks network specifiers and restricts external loads to script and
//! JSON files. Path requests made by bundle files must stay inside
//! `basedir`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Error};
use indexmap::IndexMap;
use oxc_resolver::{ResolveOptions, Resolver};
use serde::Serialize;

/// Outcome of resolving a request from a virtual module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum Resolution {
    /// A key of the bundle's file map.
    Virtual(String),
    /// A request the bundle does not contain; left to [`ExternalResolver`].
    External(String),
}

/// Pure resolver over the bundle's virtual file names.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    files: Arc<IndexMap<String, String>>,
}

impl ModuleResolver {
    pub fn new(files: Arc<IndexMap<String, String>>) -> Self {
        Self { files }
    }

    /// Resolve `request` as required from the virtual module `current`.
    ///
    /// Relative requests are tried against the requiring module's directory
    /// first, then every request is tried normalized against the bundle root.
    pub fn resolve(&self, request: &str, current: &str) -> Resolution {
        let mut candidates = Vec::with_capacity(2);
        if request.starts_with("./") || request.starts_with("../") {
            let dir = Path::new(current).parent().unwrap_or(Path::new(""));
            candidates.push(normalize(&dir.join(request)));
        }
        candidates.push(normalize(Path::new(request)));

        candidates
            .into_iter()
            .flatten()
            .find(|candidate| self.files.contains_key(candidate))
            .map(Resolution::Virtual)
            .unwrap_or_else(|| Resolution::External(request.to_string()))
    }

    pub fn source(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }
}

/// Lexically normalize a relative path into a virtual file key.
/// Returns `None` for paths that climb above the bundle root.
fn normalize(path: &Path) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(parts.join("/"))
}

/// Resolves and caches external package requests.
pub struct ExternalResolver {
    resolver: Resolver,
    basedir: PathBuf,
    /// `basedir` with symlinks resolved, as resolved paths are.
    root: PathBuf,
    resolved: HashMap<(PathBuf, String), PathBuf>,
}

impl ExternalResolver {
    /// `basedir` falls back to the process working directory.
    pub fn new(basedir: Option<PathBuf>) -> Result<Self, Error> {
        let basedir = match basedir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|e| anyhow!("Failed to determine working directory: {}", e))?,
        };
        let resolver = Resolver::new(ResolveOptions {
            condition_names: vec!["require".into(), "node".into(), "default".into()],
            extensions: vec![".js".into(), ".cjs".into(), ".json".into()],
            builtin_modules: true,
            ..Default::default()
        });
        let root = std::fs::canonicalize(&basedir).unwrap_or_else(|_| basedir.clone());
        Ok(Self {
            resolver,
            basedir,
            root,
            resolved: HashMap::new(),
        })
    }

    /// Whether `path` came out of [`Self::resolve`]; only such files are read.
    pub fn was_resolved(&self, path: &Path) -> bool {
        self.resolved.values().any(|resolved| resolved == path)
    }

    /// Resolve a request made by a bundle file. Package requests are looked
    /// up from `basedir`; absolute paths are refused and relative paths must
    /// not leave it.
    pub fn resolve_from_bundle(&mut self, request: &str) -> Result<PathBuf, Error> {
        if Path::new(request).is_absolute() {
            return Err(anyhow!("Access denied: absolute require '{}'", request));
        }
        let confined = request.starts_with("./") || request.starts_with("../") || request == "..";
        self.resolve_in(request, None, confined)
    }

    /// Resolve `request` from `from_dir` (the bundle's `basedir` when `None`)
    /// to an absolute file path.
    pub fn resolve(&mut self, request: &str, from_dir: Option<&Path>) -> Result<PathBuf, Error> {
        self.resolve_in(request, from_dir, false)
    }

    fn resolve_in(
        &mut self,
        request: &str,
        from_dir: Option<&Path>,
        confined: bool,
    ) -> Result<PathBuf, Error> {
        // Block all remote URLs
        if request.starts_with("http://")
            || request.starts_with("https://")
            || request.starts_with("data:")
            || request.starts_with("blob:")
        {
            return Err(anyhow!("Remote requires are forbidden: {}", request));
        }

        let dir = from_dir.unwrap_or(&self.basedir).to_path_buf();
        let key = (dir, request.to_string());
        if let Some(path) = self.resolved.get(&key) {
            return self.check_confined(request, path.clone(), confined);
        }

        let path = self
            .resolver
            .resolve(&key.0, request)
            .map_err(|e| {
                anyhow!(
                    "Cannot find module '{}' from '{}': {}",
                    request,
                    key.0.display(),
                    e
                )
            })?
            .into_path_buf();

        if !Self::is_extension_allowed(&path) {
            return Err(anyhow!(
                "Only .js, .cjs and .json modules can be required, got: {}",
                path.display()
            ));
        }
        let path = self.check_confined(request, path, confined)?;

        tracing::debug!("resolved external '{}' -> {}", request, path.display());
        self.resolved.insert(key, path.clone());
        Ok(path)
    }

    fn check_confined(&self, request: &str, path: PathBuf, confined: bool) -> Result<PathBuf, Error> {
        if confined && !path.starts_with(&self.root) {
            return Err(anyhow!(
                "Access denied: '{}' resolves outside {}",
                request,
                self.basedir.display()
            ));
        }
        Ok(path)
    }

    fn is_extension_allowed(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("js") | Some("cjs") | Some("json")
        )
    }
}
