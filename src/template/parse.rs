//! Splits a document shell into head/neck/tail regions and compiles each into
//! an interpolating template.
//!
//! Interpolation forms:
//! - `{{ expr }}` HTML-escaped
//! - `{{{ expr }}}` raw
//!
//! `expr` is a dotted property path into the render context (`meta.title`)
//! or one of the bound render helpers (`renderScripts()`).

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::context::RenderContext;
use crate::error::{RenderError, Result};

/// Default content placeholder.
pub const DEFAULT_PLACEHOLDER: &str = r#"<div id="app"></div>"#;

static DELIMITERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{([^{][\s\S]+?[^}])\}\}|\{\{\{([\s\S]+?)\}\}\}").unwrap()
});
static HELPER_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z_$][\w$]*)\(\s*\)$").unwrap());

/// Render helpers a template may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    ResourceHints,
    Styles,
    State,
    Scripts,
}

impl Helper {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "renderResourceHints" => Some(Self::ResourceHints),
            "renderStyles" => Some(Self::Styles),
            "renderState" => Some(Self::State),
            "renderScripts" => Some(Self::Scripts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Path(String),
    Helper(Helper),
}

impl Expression {
    fn parse(source: &str) -> Self {
        let source = source.trim();
        HELPER_CALL
            .captures(source)
            .and_then(|caps| Helper::from_name(&caps[1]))
            .map(Expression::Helper)
            .unwrap_or_else(|| Expression::Path(source.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Escaped(Expression),
    Raw(Expression),
}

/// What a compiled template reads its values from.
pub trait TemplateScope {
    fn lookup(&mut self, path: &str) -> Option<Value>;

    fn helper(&mut self, helper: Helper) -> String;
}

/// A bare context: paths resolve, helpers render nothing.
impl TemplateScope for RenderContext {
    fn lookup(&mut self, path: &str) -> Option<Value> {
        RenderContext::lookup(self, path)
    }

    fn helper(&mut self, _helper: Helper) -> String {
        String::new()
    }
}

/// One region of a parsed template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledTemplate {
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    pub fn compile(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in DELIMITERS.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Text(source[last..whole.start()].to_string()));
            }
            if let Some(expr) = caps.get(1) {
                segments.push(Segment::Escaped(Expression::parse(expr.as_str())));
            } else if let Some(expr) = caps.get(2) {
                segments.push(Segment::Raw(Expression::parse(expr.as_str())));
            }
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Text(source[last..].to_string()));
        }
        Self { segments }
    }

    pub fn render(&self, scope: &mut dyn TemplateScope) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Escaped(expr) => out.push_str(&escape_html(&evaluate(expr, scope))),
                Segment::Raw(expr) => out.push_str(&evaluate(expr, scope)),
            }
        }
        out
    }
}

fn evaluate(expr: &Expression, scope: &mut dyn TemplateScope) -> String {
    match expr {
        Expression::Helper(helper) => scope.helper(*helper),
        Expression::Path(path) => match scope.lookup(path) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        },
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// A document shell split around the content placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTemplate {
    /// Up to `</head>` (or `<body>`, or the placeholder).
    pub head: CompiledTemplate,
    /// From the head boundary to the placeholder.
    pub neck: CompiledTemplate,
    /// Everything after the placeholder.
    pub tail: CompiledTemplate,
    wrapper_open: String,
    wrapper_close: String,
}

impl ParsedTemplate {
    /// Opening and closing tags of the placeholder element that rendered
    /// content is wrapped in. Empty for non-element placeholders.
    pub fn wrapper(&self) -> (&str, &str) {
        (&self.wrapper_open, &self.wrapper_close)
    }
}

/// A template given as text or already parsed.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    Raw(String),
    Parsed(Arc<ParsedTemplate>),
}

impl From<String> for TemplateSource {
    fn from(template: String) -> Self {
        Self::Raw(template)
    }
}

impl From<&str> for TemplateSource {
    fn from(template: &str) -> Self {
        Self::Raw(template.to_string())
    }
}

impl From<ParsedTemplate> for TemplateSource {
    fn from(template: ParsedTemplate) -> Self {
        Self::Parsed(Arc::new(template))
    }
}

impl From<Arc<ParsedTemplate>> for TemplateSource {
    fn from(template: Arc<ParsedTemplate>) -> Self {
        Self::Parsed(template)
    }
}

/// Parse `source` around `placeholder`. Already parsed templates pass
/// through untouched.
pub fn parse_template(
    source: impl Into<TemplateSource>,
    placeholder: &str,
) -> Result<Arc<ParsedTemplate>> {
    let template = match source.into() {
        TemplateSource::Parsed(parsed) => return Ok(parsed),
        TemplateSource::Raw(template) => template,
    };

    let content = template
        .find(placeholder)
        .ok_or_else(|| RenderError::TemplatePlaceholderMissing {
            placeholder: placeholder.to_string(),
        })?;
    let boundary = template
        .find("</head>")
        .or_else(|| template.find("<body>"))
        .unwrap_or(content);
    // a boundary after the placeholder would make the neck negative
    let boundary = boundary.min(content);

    let (wrapper_open, wrapper_close) = wrapper_tags(placeholder);
    Ok(Arc::new(ParsedTemplate {
        head: CompiledTemplate::compile(&template[..boundary]),
        neck: CompiledTemplate::compile(&template[boundary..content]),
        tail: CompiledTemplate::compile(&template[content + placeholder.len()..]),
        wrapper_open,
        wrapper_close,
    }))
}

fn wrapper_tags(placeholder: &str) -> (String, String) {
    match placeholder.find('>') {
        Some(end) if placeholder[end + 1..].starts_with("</") => (
            placeholder[..=end].to_string(),
            placeholder[end + 1..].to_string(),
        ),
        _ => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE: &str = r#"<html><head><title>{{ title }}</title></head><body><div id="app"></div><footer>{{{ footer }}}</footer></body></html>"#;

    #[test]
    fn test_splits_around_head_and_placeholder() {
        let parsed = parse_template(TEMPLATE, DEFAULT_PLACEHOLDER).unwrap();
        let mut ctx = RenderContext::new()
            .with("title", "Home")
            .with("footer", "<b>f</b>");

        assert_eq!(parsed.head.render(&mut ctx), "<html><head><title>Home</title>");
        assert_eq!(parsed.neck.render(&mut ctx), "</head><body>");
        assert_eq!(
            parsed.tail.render(&mut ctx),
            "<footer><b>f</b></footer></body></html>"
        );
        assert_eq!(parsed.wrapper(), (r#"<div id="app">"#, "</div>"));
    }

    #[test]
    fn test_boundary_falls_back_to_body_then_placeholder() {
        let parsed = parse_template(r#"<body><div id="app"></div></body>"#, DEFAULT_PLACEHOLDER).unwrap();
        let mut ctx = RenderContext::new();
        assert_eq!(parsed.head.render(&mut ctx), "");
        assert_eq!(parsed.neck.render(&mut ctx), "<body>");

        let parsed = parse_template(r#"<main><div id="app"></div></main>"#, DEFAULT_PLACEHOLDER).unwrap();
        assert_eq!(parsed.head.render(&mut ctx), "<main>");
        assert_eq!(parsed.neck.render(&mut ctx), "");
        assert_eq!(parsed.tail.render(&mut ctx), "</main>");
    }

    #[test]
    fn test_missing_placeholder() {
        let err = parse_template("<html><body></body></html>", DEFAULT_PLACEHOLDER).unwrap_err();
        assert!(matches!(err, RenderError::TemplatePlaceholderMissing { .. }));
    }

    #[test]
    fn test_custom_placeholder() {
        let parsed = parse_template("<body><!--ssr-outlet--></body>", "<!--ssr-outlet-->").unwrap();
        let mut ctx = RenderContext::new();
        assert_eq!(parsed.neck.render(&mut ctx), "<body>");
        assert_eq!(parsed.tail.render(&mut ctx), "</body>");
        assert_eq!(parsed.wrapper(), ("", ""));
    }

    #[test]
    fn test_escaped_and_raw_interpolation() {
        let template = CompiledTemplate::compile("{{ v }}|{{{ v }}}|{{ meta.count }}|{{ missing }}|{{ items.1 }}");
        let mut ctx = RenderContext::new()
            .with("v", r#"<a href="x">'&'</a>"#)
            .with("meta", json!({ "count": 3 }))
            .with("items", json!(["a", "b"]));
        assert_eq!(
            template.render(&mut ctx),
            r#"&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;|<a href="x">'&'</a>|3||b"#
        );
    }

    #[test]
    fn test_helper_calls_are_recognized() {
        let template = CompiledTemplate::compile("<head>{{{ renderStyles() }}}{{{ renderScripts ( ) }}}</head>");
        assert_eq!(
            template.segments,
            vec![
                Segment::Text("<head>".into()),
                Segment::Raw(Expression::Helper(Helper::Styles)),
                Segment::Raw(Expression::Path("renderScripts ( )".into())),
                Segment::Text("</head>".into()),
            ]
        );
    }

    #[test]
    fn test_parsed_template_passes_through() {
        let parsed = parse_template(TEMPLATE, DEFAULT_PLACEHOLDER).unwrap();
        let again = parse_template(parsed.clone(), "ignored").unwrap();
        assert!(Arc::ptr_eq(&parsed, &again));
    }
}
