//! Lazily parsed source maps and stack-trace rewriting for sandbox errors.

use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use sourcemap::{DecodedMap, SourceMap};
use tokio::sync::OnceCell;

use crate::error::RenderError;
use crate::runtime::MODULE_WRAPPER_PREFIX;

static TRACE_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([^)]+\.js):(\d+):(\d+)\)$").unwrap());

/// One raw source map whose parse is deferred until a trace needs it.
#[derive(Debug)]
struct MapHandle {
    raw: Value,
    parsed: OnceCell<Option<Arc<SourceMap>>>,
}

impl MapHandle {
    async fn consumer(&self, file: &str) -> Option<Arc<SourceMap>> {
        self.parsed
            .get_or_init(|| async { parse(file, &self.raw).map(Arc::new) })
            .await
            .clone()
    }
}

fn parse(file: &str, raw: &Value) -> Option<SourceMap> {
    let bytes = serde_json::to_vec(raw).ok()?;
    match sourcemap::decode_slice(&bytes) {
        Ok(DecodedMap::Regular(map)) => Some(map),
        Ok(DecodedMap::Index(index)) => index.flatten().ok(),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("ignoring unparseable source map for {}: {}", file, e);
            None
        }
    }
}

/// Source map consumers keyed by bundled file name (`main.js`).
#[derive(Debug, Clone, Default)]
pub struct SourceMapConsumers {
    maps: Arc<IndexMap<String, MapHandle>>,
}

impl SourceMapConsumers {
    /// Register every raw map. Nothing is parsed until a trace asks for it.
    pub fn new(raw_maps: &IndexMap<String, Value>) -> Self {
        let maps = raw_maps
            .iter()
            .map(|(file, raw)| {
                let handle = MapHandle {
                    raw: raw.clone(),
                    parsed: OnceCell::new(),
                };
                (file.clone(), handle)
            })
            .collect();
        Self {
            maps: Arc::new(maps),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Rewrite the stack of an execution error in place. Errors without a
    /// stack, or lines no map can place, are left untouched.
    pub async fn rewrite_error_trace(&self, error: &mut RenderError) {
        if let RenderError::Execution {
            stack: Some(stack), ..
        } = error
        {
            *stack = self.rewrite_stack(stack).await;
        }
    }

    pub async fn rewrite_stack(&self, stack: &str) -> String {
        let mut lines = Vec::new();
        for line in stack.split('\n') {
            lines.push(self.rewrite_line(line).await);
        }
        lines.join("\n")
    }

    async fn rewrite_line(&self, line: &str) -> String {
        let Some(caps) = TRACE_LOCATION.captures(line) else {
            return line.to_string();
        };
        let Some(handle) = self.maps.get(&caps[1]) else {
            return line.to_string();
        };
        let Some(map) = handle.consumer(&caps[1]).await else {
            return line.to_string();
        };
        match original_position(&map, &caps) {
            Some(position) => TRACE_LOCATION.replace(line, position.as_str()).into_owned(),
            None => line.to_string(),
        }
    }
}

fn original_position(map: &SourceMap, caps: &Captures<'_>) -> Option<String> {
    let line: u32 = caps[2].parse().ok()?;
    let column: u32 = caps[3].parse().ok()?;
    let mut column = column.saturating_sub(1);
    if line == 1 {
        // the module wrapper shares the first line with the file's source
        column = column.saturating_sub(MODULE_WRAPPER_PREFIX.len() as u32);
    }
    let token = map.lookup_token(line.checked_sub(1)?, column)?;
    let source = token.get_source()?;
    let source = source.strip_prefix("webpack:///").unwrap_or(source);
    // `$` in a replacement is a capture reference, escape it
    Some(format!(
        "({}:{}:{})",
        source.replace('$', "$$"),
        token.get_src_line() + 1,
        token.get_src_col()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn consumers() -> SourceMapConsumers {
        // main.js line 1 col 0 -> src/app.js line 10 col 4
        // main.js line 1 col 5 -> src/app.js line 10 col 6
        // main.js line 2 col 0 -> src/app.js line 20 col 2
        let mut maps = IndexMap::new();
        maps.insert(
            "main.js".to_string(),
            json!({
                "version": 3,
                "file": "main.js",
                "sources": ["webpack:///src/app.js"],
                "names": [],
                "mappings": "AASI,KAAE;AAUF"
            }),
        );
        maps.insert("broken.js".to_string(), json!({ "version": "nope" }));
        SourceMapConsumers::new(&maps)
    }

    #[tokio::test]
    async fn test_rewrites_registered_file() {
        let stack = "Error: boom\n    at render (main.js:2:1)\n    at other (lib.js:3:4)";
        let rewritten = consumers().rewrite_stack(stack).await;
        assert_eq!(
            rewritten,
            "Error: boom\n    at render (src/app.js:20:2)\n    at other (lib.js:3:4)"
        );
    }

    #[tokio::test]
    async fn test_first_line_columns_skip_module_wrapper() {
        let prefix = MODULE_WRAPPER_PREFIX.len();
        let stack = format!(
            "    at a (main.js:1:{})\n    at b (main.js:1:{})",
            prefix + 1,
            prefix + 6
        );
        assert_eq!(
            consumers().rewrite_stack(&stack).await,
            "    at a (src/app.js:10:4)\n    at b (src/app.js:10:6)"
        );
    }

    #[tokio::test]
    async fn test_unparseable_map_degrades_to_original_line() {
        let stack = "    at x (broken.js:1:1)";
        assert_eq!(consumers().rewrite_stack(stack).await, stack);
    }

    #[tokio::test]
    async fn test_rewrites_execution_error_only() {
        let mut err = RenderError::Execution {
            message: "boom".into(),
            stack: Some(format!("    at f (main.js:1:{})", MODULE_WRAPPER_PREFIX.len() + 1)),
        };
        consumers().rewrite_error_trace(&mut err).await;
        assert_eq!(err.stack(), Some("    at f (src/app.js:10:4)"));

        let mut other = RenderError::Render("x".into());
        consumers().rewrite_error_trace(&mut other).await;
        assert!(other.stack().is_none());
    }
}
