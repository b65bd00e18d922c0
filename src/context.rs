//! Per-request render context and the values that cross the sandbox boundary.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::manifest::Resource;

/// Request-scoped data threaded through bundle execution and template
/// composition.
///
/// The reserved fields are what bundle code and the template renderer talk
/// through; everything else the caller puts in is carried in `data` and is
/// visible to bundle code as plain properties of the context object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderContext {
    /// Component identifiers registered by bundle code while rendering.
    #[serde(rename = "_registeredComponents", default)]
    pub registered_components: IndexSet<String>,

    /// Styles collected by the bundle's style loader.
    #[serde(rename = "_styles", default, skip_serializing_if = "Option::is_none")]
    pub style_collection: Option<StyleCollection>,

    /// Pre-rendered inline style markup, used when no collection is present.
    #[serde(rename = "styles", default, skip_serializing_if = "Option::is_none")]
    pub inline_styles: Option<String>,

    /// Head metadata markup injected before resource hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,

    /// Initial application state serialized for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,

    /// State of async components, exposed as `window.ASYNC_COMPONENTS_STATE`.
    #[serde(rename = "asyncState", default, skip_serializing_if = "Option::is_none")]
    pub async_state: Option<Value>,

    /// Caller-supplied request data (`url`, cookies, ...).
    #[serde(flatten)]
    pub data: Map<String, Value>,

    #[serde(skip)]
    pub(crate) mapped_files: Option<Vec<Resource>>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from caller data, e.g. `json!({ "url": "/" })`.
    ///
    /// Reserved keys present in `value` populate their typed fields.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn register_component(&mut self, id: impl Into<String>) {
        self.registered_components.insert(id.into());
        self.mapped_files = None;
    }

    /// Inline styles for this request: the rendered collection if the bundle
    /// collected any, else the raw `styles` text.
    pub fn rendered_styles(&self) -> Option<String> {
        match &self.style_collection {
            Some(collection) => Some(collection.render()),
            None => self.inline_styles.clone(),
        }
    }

    /// Resolve a dotted property path (`meta.title`, `items.0`) for template
    /// interpolation.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.').map(str::trim);
        let first = segments.next()?;
        let root = match first {
            "head" => self.head.clone().map(Value::String),
            "state" => self.state.clone(),
            "asyncState" => self.async_state.clone(),
            "styles" => self.rendered_styles().map(Value::String),
            _ => self.data.get(first).cloned(),
        }?;
        segments.try_fold(root, |value, segment| match value {
            Value::Object(mut map) => map.remove(segment),
            Value::Array(mut items) => {
                let index = segment.parse::<usize>().ok()?;
                (index < items.len()).then(|| items.swap_remove(index))
            }
            _ => None,
        })
    }
}

/// Styles a style loader collected during rendering, keyed by style id.
///
/// This is the only piece of first-evaluation state that shared contexts hand
/// to later requests, so it is a closed shape: `Clone` is the deep copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StyleCollection(pub IndexMap<String, StyleEntry>);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleEntry {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub css: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
}

impl StyleCollection {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self) -> String {
        self.0
            .values()
            .map(|entry| {
                let media = entry
                    .media
                    .as_deref()
                    .map(|m| format!(" media=\"{m}\""))
                    .unwrap_or_default();
                format!(
                    "<style data-ssr-id=\"{}\"{media}>{}</style>",
                    entry.ids.join(" "),
                    entry.css
                )
            })
            .collect()
    }
}

/// The value a bundle's entry produced for one request.
///
/// Only JSON-representable data crosses the sandbox boundary; functions on
/// the exported value are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Component(pub Value);

impl Component {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Component {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for Component {
    fn from(markup: &str) -> Self {
        Self(Value::String(markup.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_fields_round_trip_through_json() {
        let ctx = RenderContext::from_value(json!({
            "url": "/x",
            "head": "<title>x</title>",
            "_registeredComponents": ["a", "b"],
            "_styles": { "s1": { "ids": ["s1"], "css": ".a{}" } }
        }))
        .unwrap();

        assert_eq!(ctx.get("url"), Some(&json!("/x")));
        assert_eq!(ctx.head.as_deref(), Some("<title>x</title>"));
        assert_eq!(ctx.registered_components.len(), 2);

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["url"], "/x");
        assert_eq!(value["_registeredComponents"], json!(["a", "b"]));
        assert!(value.get("state").is_none());
    }

    #[test]
    fn test_lookup_paths() {
        let ctx = RenderContext::new()
            .with("meta", json!({ "title": "Home", "tags": ["a", "b"] }));
        assert_eq!(ctx.lookup("meta.title"), Some(json!("Home")));
        assert_eq!(ctx.lookup("meta.tags.1"), Some(json!("b")));
        assert_eq!(ctx.lookup("meta.missing"), None);
        assert_eq!(ctx.lookup("nope"), None);
    }

    #[test]
    fn test_style_collection_render() {
        let mut styles = StyleCollection::default();
        styles.0.insert(
            "a".into(),
            StyleEntry {
                ids: vec!["a".into(), "a2".into()],
                css: ".a{color:red}".into(),
                media: None,
            },
        );
        styles.0.insert(
            "b".into(),
            StyleEntry {
                ids: vec!["b".into()],
                css: ".b{}".into(),
                media: Some("print".into()),
            },
        );
        assert_eq!(
            styles.render(),
            "<style data-ssr-id=\"a a2\">.a{color:red}</style>\
             <style data-ssr-id=\"b\" media=\"print\">.b{}</style>"
        );
    }

    #[test]
    fn test_collection_takes_precedence_over_inline_styles() {
        let mut ctx = RenderContext::new();
        ctx.inline_styles = Some("<style>raw</style>".into());
        assert_eq!(ctx.rendered_styles().as_deref(), Some("<style>raw</style>"));

        ctx.style_collection = Some(StyleCollection::default());
        assert_eq!(ctx.rendered_styles().as_deref(), Some(""));
    }
}
