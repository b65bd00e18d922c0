//! Resource hints, styles, state and script tags for a render, and the
//! buffered document composition built from them.

use std::sync::Arc;

use serde_json::Value;

use crate::context::RenderContext;
use crate::error::{RenderError, Result};
use crate::manifest::{is_css, is_js, AsyncFileMapper, ClientManifest, Resource};
use crate::options::{FilePredicate, RendererOptions};

use super::parse::{parse_template, Helper, ParsedTemplate, TemplateScope};
use super::stream::{EventHub, TemplateStream};

const AUTO_REMOVE: &str = ";(function(){var s;(s=document.currentScript||document.scripts[document.scripts.length-1]).parentNode.removeChild(s);}());";

struct ManifestAssets {
    manifest: ClientManifest,
    /// `publicPath` without its trailing slash.
    public_path: String,
    preload_files: Vec<Resource>,
    prefetch_files: Vec<Resource>,
    mapper: AsyncFileMapper,
}

/// Renders the per-request pieces injected around the application markup.
///
/// Without a template it is still usable for rendering hints and scripts
/// into a caller-owned document.
pub struct TemplateRenderer {
    inject: bool,
    production: bool,
    template: Option<Arc<ParsedTemplate>>,
    assets: Option<ManifestAssets>,
    should_preload: Option<FilePredicate>,
    should_prefetch: Option<FilePredicate>,
}

impl TemplateRenderer {
    pub fn new(options: &RendererOptions) -> Result<Self> {
        let template = options
            .template
            .clone()
            .map(|source| parse_template(source, &options.content_placeholder))
            .transpose()?;

        let assets = options.client_manifest.clone().map(|manifest| ManifestAssets {
            public_path: manifest.public_path.trim_end_matches('/').to_string(),
            preload_files: manifest.initial.iter().map(|f| Resource::new(f)).collect(),
            prefetch_files: manifest.async_files.iter().map(|f| Resource::new(f)).collect(),
            mapper: AsyncFileMapper::new(&manifest),
            manifest,
        });

        Ok(Self {
            inject: options.inject,
            production: options.production,
            template,
            assets,
            should_preload: options.should_preload.clone(),
            should_prefetch: options.should_prefetch.clone(),
        })
    }

    pub fn inject(&self) -> bool {
        self.inject
    }

    pub fn template(&self) -> Option<&Arc<ParsedTemplate>> {
        self.template.as_ref()
    }

    /// Client files for the components registered in `context`, memoized on
    /// the context.
    pub fn used_async_files(&self, context: &mut RenderContext) -> Vec<Resource> {
        let Some(assets) = &self.assets else {
            return Vec::new();
        };
        context
            .mapped_files
            .get_or_insert_with(|| {
                assets
                    .mapper
                    .map(context.registered_components.iter().map(String::as_str))
                    .iter()
                    .map(|file| Resource::new(file))
                    .collect()
            })
            .clone()
    }

    /// Initial files followed by the async files this render used. Handy
    /// for HTTP/2 push.
    pub fn preload_files(&self, context: &mut RenderContext) -> Vec<Resource> {
        let Some(assets) = &self.assets else {
            return Vec::new();
        };
        let mut files = assets.preload_files.clone();
        files.extend(self.used_async_files(context));
        files
    }

    pub fn render_resource_hints(&self, context: &mut RenderContext) -> String {
        self.render_preload_links(context) + &self.render_prefetch_links(context)
    }

    pub fn render_preload_links(&self, context: &mut RenderContext) -> String {
        let Some(assets) = &self.assets else {
            return String::new();
        };
        self.preload_files(context)
            .iter()
            .filter(|resource| match &self.should_preload {
                Some(should_preload) => should_preload(&resource.file_without_query, resource.as_type),
                None => matches!(resource.as_type, "script" | "style"),
            })
            .map(|resource| {
                let as_attr = match resource.as_type {
                    "" => String::new(),
                    as_type => format!(" as=\"{as_type}\""),
                };
                let extra = if resource.as_type == "font" {
                    format!(" type=\"font/{}\" crossorigin", resource.extension)
                } else {
                    String::new()
                };
                format!(
                    "<link rel=\"preload\" href=\"{}/{}\"{as_attr}{extra}>",
                    assets.public_path, resource.file
                )
            })
            .collect()
    }

    pub fn render_prefetch_links(&self, context: &mut RenderContext) -> String {
        let Some(assets) = &self.assets else {
            return String::new();
        };
        let used = self.used_async_files(context);
        assets
            .prefetch_files
            .iter()
            .filter(|resource| match &self.should_prefetch {
                Some(should_prefetch) => should_prefetch(&resource.file_without_query, resource.as_type),
                None => true,
            })
            .filter(|resource| !used.iter().any(|u| u.file == resource.file))
            .map(|resource| {
                format!(
                    "<link rel=\"prefetch\" href=\"{}/{}\">",
                    assets.public_path, resource.file
                )
            })
            .collect()
    }

    /// Stylesheet links for the manifest's CSS files, then the inline styles
    /// collected during the render.
    pub fn render_styles(&self, context: &RenderContext) -> String {
        let mut out = String::new();
        if let Some(assets) = &self.assets {
            for file in assets.manifest.all.iter().filter(|f| is_css(f)) {
                out.push_str(&format!(
                    "<link rel=\"stylesheet\" href=\"{}/{}\">",
                    assets.public_path, file
                ));
            }
        }
        out.push_str(&context.rendered_styles().unwrap_or_default());
        out
    }

    /// `window.__INITIAL_STATE__` from the context's `state`.
    pub fn render_state(&self, context: &RenderContext) -> String {
        self.render_state_with(context, "state", "__INITIAL_STATE__")
    }

    /// State script for an arbitrary context key and window property.
    pub fn render_state_with(&self, context: &RenderContext, context_key: &str, window_key: &str) -> String {
        let state = match context_key {
            "state" => context.state.clone(),
            key => context.lookup(key),
        };
        match state {
            Some(state) if is_truthy(&state) => {
                let auto_remove = if self.production { AUTO_REMOVE } else { "" };
                format!(
                    "<script>window.{window_key}={}{auto_remove}</script>",
                    serialize_state(&state)
                )
            }
            _ => String::new(),
        }
    }

    /// `window.ASYNC_COMPONENTS_STATE` from the context's `asyncState`.
    pub fn render_async_state(&self, context: &RenderContext) -> String {
        match &context.async_state {
            Some(state) if !state.is_null() => format!(
                "<script>window.ASYNC_COMPONENTS_STATE={}</script>",
                serialize_state(state)
            ),
            _ => String::new(),
        }
    }

    /// Script tags: the first initial file, then the async files this render
    /// used, then the remaining initial files.
    pub fn render_scripts(&self, context: &mut RenderContext) -> String {
        let Some(assets) = &self.assets else {
            return String::new();
        };
        let used = self.used_async_files(context);
        let (first, rest) = match assets.preload_files.split_first() {
            Some((first, rest)) => (Some(first), rest),
            None => (None, &[][..]),
        };
        first
            .into_iter()
            .chain(used.iter())
            .chain(rest.iter())
            .filter(|resource| is_js(&resource.file))
            .map(|resource| {
                format!(
                    "<script src=\"{}/{}\" defer></script>",
                    assets.public_path, resource.file
                )
            })
            .collect()
    }

    /// Compose the full document around already rendered `content`.
    pub fn render_sync(&self, content: &str, context: &mut RenderContext) -> Result<String> {
        let template = self
            .template
            .clone()
            .ok_or(RenderError::MissingTemplate { operation: "render_sync" })?;
        let (open, close) = template.wrapper();
        let mut out = String::new();
        let mut scope = BoundContext::new(self, context);

        out.push_str(&template.head.render(&mut scope));
        if self.inject {
            out.push_str(scope.context.head.as_deref().unwrap_or_default());
            out.push_str(&self.render_resource_hints(scope.context));
            out.push_str(&self.render_styles(scope.context));
        }
        out.push_str(&template.neck.render(&mut scope));
        out.push_str(open);
        out.push_str(content);
        out.push_str(close);
        if self.inject {
            out.push_str(&self.render_async_state(scope.context));
            out.push_str(&self.render_state(scope.context));
            out.push_str(&self.render_scripts(scope.context));
        }
        out.push_str(&template.tail.render(&mut scope));
        Ok(out)
    }

    /// Incremental composer for one render.
    pub fn create_stream(
        self: &Arc<Self>,
        context: RenderContext,
        events: EventHub,
    ) -> Result<TemplateStream> {
        let template = self
            .template
            .clone()
            .ok_or(RenderError::MissingTemplate { operation: "create_stream" })?;
        Ok(TemplateStream::new(self.clone(), template, context, events))
    }
}

/// A render context with the render helpers bound to it.
pub struct BoundContext<'a> {
    renderer: &'a TemplateRenderer,
    pub context: &'a mut RenderContext,
}

impl<'a> BoundContext<'a> {
    pub fn new(renderer: &'a TemplateRenderer, context: &'a mut RenderContext) -> Self {
        Self { renderer, context }
    }
}

impl TemplateScope for BoundContext<'_> {
    fn lookup(&mut self, path: &str) -> Option<Value> {
        self.context.lookup(path)
    }

    fn helper(&mut self, helper: Helper) -> String {
        match helper {
            Helper::ResourceHints => self.renderer.render_resource_hints(self.context),
            Helper::Styles => self.renderer.render_styles(self.context),
            Helper::State => self.renderer.render_state(self.context),
            Helper::Scripts => self.renderer.render_scripts(self.context),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// JSON safe to embed in an inline `<script>`.
pub fn serialize_state(state: &Value) -> String {
    let json = state.to_string();
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '/' => out.push_str("\\u002F"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::DEFAULT_PLACEHOLDER;
    use serde_json::json;

    fn manifest() -> ClientManifest {
        ClientManifest::from_json(
            r#"{
                "publicPath": "/static/",
                "all": ["runtime.js", "main.js", "0.js", "1.js", "main.css", "font.woff2", "logo.png"],
                "initial": ["runtime.js", "main.js", "main.css"],
                "async": ["0.js", "1.js"],
                "modules": {
                    "home": [2, 5],
                    "about": [3],
                    "shared": [1, 6]
                }
            }"#,
        )
        .unwrap()
    }

    fn renderer(options: RendererOptions) -> TemplateRenderer {
        TemplateRenderer::new(&options).unwrap()
    }

    fn with_manifest() -> TemplateRenderer {
        renderer(RendererOptions {
            client_manifest: Some(manifest()),
            ..Default::default()
        })
    }

    #[test]
    fn test_render_sync_without_inject_substitutes_placeholder() {
        let template = r#"<html><head></head><body><div id="app"></div></body></html>"#;
        let renderer = renderer(RendererOptions {
            inject: false,
            template: Some(template.into()),
            ..Default::default()
        });
        let html = renderer.render_sync("<p>hi</p>", &mut RenderContext::new()).unwrap();
        assert_eq!(
            html,
            r#"<html><head></head><body><div id="app"><p>hi</p></div></body></html>"#
        );
    }

    #[test]
    fn test_render_sync_injects_in_order() {
        let renderer = renderer(RendererOptions {
            template: Some(r#"<html><head><title>{{ title }}</title></head><body><div id="app"></div></body></html>"#.into()),
            client_manifest: Some(manifest()),
            ..Default::default()
        });
        let mut ctx = RenderContext::new().with("title", "T");
        ctx.head = Some("<meta name=\"x\">".into());
        ctx.inline_styles = Some("<style>.a{}</style>".into());
        ctx.state = Some(json!({ "n": 1 }));
        ctx.register_component("home");

        let html = renderer.render_sync("<p>x</p>", &mut ctx).unwrap();
        let order = [
            "<title>T</title>",
            "<meta name=\"x\">",
            "rel=\"preload\"",
            "rel=\"prefetch\"",
            "rel=\"stylesheet\"",
            "<style>.a{}</style>",
            "</head>",
            "<div id=\"app\"><p>x</p></div>",
            "window.__INITIAL_STATE__",
            "<script src=",
            "</body>",
        ];
        let positions: Vec<usize> = order.iter().map(|needle| html.find(needle).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{html}");
    }

    #[test]
    fn test_render_sync_requires_template() {
        let err = with_manifest().render_sync("", &mut RenderContext::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingTemplate { .. }));
    }

    #[test]
    fn test_preload_defaults_to_scripts_and_styles() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        ctx.register_component("home");
        assert_eq!(
            renderer.render_preload_links(&mut ctx),
            concat!(
                r#"<link rel="preload" href="/static/runtime.js" as="script">"#,
                r#"<link rel="preload" href="/static/main.js" as="script">"#,
                r#"<link rel="preload" href="/static/main.css" as="style">"#,
                r#"<link rel="preload" href="/static/0.js" as="script">"#,
            )
        );
    }

    #[test]
    fn test_should_preload_override_and_fonts() {
        let renderer = renderer(RendererOptions {
            client_manifest: Some(manifest()),
            should_preload: Some(Arc::new(|file: &str, as_type: &str| {
                as_type == "font" || file == "main.js"
            })),
            ..Default::default()
        });
        let mut ctx = RenderContext::new();
        ctx.register_component("home");
        assert_eq!(
            renderer.render_preload_links(&mut ctx),
            concat!(
                r#"<link rel="preload" href="/static/main.js" as="script">"#,
                r#"<link rel="preload" href="/static/font.woff2" as="font" type="font/woff2" crossorigin>"#,
            )
        );
    }

    #[test]
    fn test_unregistered_async_file_is_not_preloaded() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        let preload = renderer.render_preload_links(&mut ctx);
        assert!(!preload.contains("0.js"));
        assert!(!renderer.render_scripts(&mut ctx).contains("0.js"));

        // registering in a new request brings it in
        let mut ctx = RenderContext::new();
        ctx.register_component("home");
        assert!(renderer.render_preload_links(&mut ctx).contains("/static/0.js"));
    }

    #[test]
    fn test_prefetch_skips_used_async_files() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        assert_eq!(
            renderer.render_prefetch_links(&mut ctx),
            r#"<link rel="prefetch" href="/static/0.js"><link rel="prefetch" href="/static/1.js">"#
        );

        let mut ctx = RenderContext::new();
        ctx.register_component("home");
        assert_eq!(
            renderer.render_prefetch_links(&mut ctx),
            r#"<link rel="prefetch" href="/static/1.js">"#
        );
    }

    #[test]
    fn test_script_ordering() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        ctx.register_component("about");
        ctx.register_component("home");
        assert_eq!(
            renderer.render_scripts(&mut ctx),
            concat!(
                r#"<script src="/static/runtime.js" defer></script>"#,
                r#"<script src="/static/1.js" defer></script>"#,
                r#"<script src="/static/0.js" defer></script>"#,
                r#"<script src="/static/main.js" defer></script>"#,
            )
        );
    }

    #[test]
    fn test_used_async_files_are_memoized_until_registration_changes() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        ctx.register_component("home");
        let first = renderer.used_async_files(&mut ctx);
        ctx.registered_components.insert("about".into());
        assert_eq!(renderer.used_async_files(&mut ctx), first);

        ctx.register_component("shared");
        let files: Vec<String> = renderer
            .used_async_files(&mut ctx)
            .into_iter()
            .map(|r| r.file)
            .collect();
        assert_eq!(files, vec!["0.js", "font.woff2", "1.js", "logo.png"]);
    }

    #[test]
    fn test_styles_links_then_collected_styles() {
        let renderer = with_manifest();
        let ctx = RenderContext::from_value(json!({
            "_styles": { "a": { "ids": ["a1", "a2"], "css": ".a{}", "media": "print" } },
            "styles": "<style>ignored</style>"
        }))
        .unwrap();
        assert_eq!(
            renderer.render_styles(&ctx),
            r#"<link rel="stylesheet" href="/static/main.css"><style data-ssr-id="a1 a2" media="print">.a{}</style>"#
        );
    }

    #[test]
    fn test_state_script_is_escaped() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        assert_eq!(renderer.render_state(&ctx), "");

        ctx.state = Some(json!({ "html": "</script><script>alert(1)</script>", "sep": "\u{2028}" }));
        assert_eq!(
            renderer.render_state(&ctx),
            r#"<script>window.__INITIAL_STATE__={"html":"\u003C\u002Fscript\u003E\u003Cscript\u003Ealert(1)\u003C\u002Fscript\u003E","sep":"\u2028"}</script>"#
        );
    }

    #[test]
    fn test_state_script_removes_itself_in_production() {
        let renderer = renderer(RendererOptions {
            production: true,
            ..Default::default()
        });
        let ctx = RenderContext::new().with("store", json!({ "a": 1 }));
        let script = renderer.render_state_with(&ctx, "store", "__STORE__");
        assert!(script.starts_with(r#"<script>window.__STORE__={"a":1};(function(){"#));
        assert!(script.ends_with("}());</script>"));
    }

    #[test]
    fn test_async_state_script() {
        let renderer = with_manifest();
        let mut ctx = RenderContext::new();
        assert_eq!(renderer.render_async_state(&ctx), "");
        ctx.async_state = Some(json!({ "resolved": [1] }));
        assert_eq!(
            renderer.render_async_state(&ctx),
            r#"<script>window.ASYNC_COMPONENTS_STATE={"resolved":[1]}</script>"#
        );
    }

    #[test]
    fn test_template_helpers_for_manual_injection() {
        let renderer = renderer(RendererOptions {
            inject: false,
            template: Some(
                r#"<html><head>{{{ renderResourceHints() }}}{{{ renderStyles() }}}</head><body><div id="app"></div>{{{ renderState() }}}{{{ renderScripts() }}}</body></html>"#.into(),
            ),
            client_manifest: Some(manifest()),
            ..Default::default()
        });
        let mut ctx = RenderContext::new();
        ctx.state = Some(json!(1));
        let html = renderer.render_sync("x", &mut ctx).unwrap();
        assert!(html.starts_with(r#"<html><head><link rel="preload" href="/static/runtime.js" as="script">"#));
        assert!(html.contains(r#"<link rel="stylesheet" href="/static/main.css"></head>"#));
        assert!(html.contains(r#"<div id="app">x</div><script>window.__INITIAL_STATE__=1</script><script src="/static/runtime.js" defer></script>"#));
    }

    #[test]
    fn test_without_manifest_hints_are_empty() {
        let renderer = renderer(RendererOptions {
            template: Some(format!("<body>{DEFAULT_PLACEHOLDER}</body>").into()),
            ..Default::default()
        });
        let mut ctx = RenderContext::new();
        assert_eq!(renderer.render_resource_hints(&mut ctx), "");
        assert_eq!(renderer.render_scripts(&mut ctx), "");
        assert_eq!(
            renderer.render_sync("a", &mut ctx).unwrap(),
            r#"<body><div id="app">a</div></body>"#
        );
    }
}
