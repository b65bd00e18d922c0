//! # SSR Bundle Renderer
//!
//! Server-side rendering of pre-built application bundles inside a sandboxed
//! deno_core runtime, streamed into an HTML document shell together with
//! resource hints, inline styles, serialized state and script tags.
//!
//! ## Sandbox Guarantees
//!
//! - **Isolated scopes**: bundle code sees ECMAScript intrinsics, a console,
//!   timers, `atob`/`btoa`, `Buffer` and `process.env.NODE_ENV`, nothing
//!   else. Fresh renders also undo changes to the shared intrinsics
//! - **No filesystem access**: `require` reads bundle files from memory; from
//!   disk it only reads packages resolved from `basedir` and paths inside it
//! - **No network access**: remote specifiers are refused
//! - **No leaked timers**: pending timers are cancelled once a render settles
//! - **Bounded**: optional heap limit and per-render timeout
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ssr_bundle_renderer::{BundleRenderer, RenderContext, RendererOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let renderer = BundleRenderer::new(
//!         std::path::PathBuf::from("/app/dist/server-bundle.json"),
//!         RendererOptions {
//!             template: Some(std::fs::read_to_string("index.html").unwrap().into()),
//!             ..Default::default()
//!         },
//!     )
//!     .unwrap();
//!
//!     let mut context = RenderContext::new().with("url", "/page");
//!     let html = renderer.render_to_string(&mut context).await.unwrap();
//!     println!("{}", html);
//! }
//! ```

mod bundle;
mod bundle_renderer;
mod context;
mod error;
mod manifest;
mod ops;
mod options;
mod renderer;
mod resolver;
mod runtime;
mod sandbox;
mod sanitize;
mod source_map;
pub mod template;

pub use bundle::{Bundle, BundleSource, RawBundle, ServerBundle, INLINE_ENTRY};
pub use bundle_renderer::BundleRenderer;
pub use context::{Component, RenderContext, StyleCollection, StyleEntry};
pub use error::{RenderError, Result};
pub use manifest::{
    is_css, is_js, module_id, AssetRef, AsyncFileMapper, BuildStats, ChunkStats, ClientManifest,
    EntrypointStats, ModuleStats, Resource,
};
pub use ops::ConsoleOutput;
pub use options::{FilePredicate, RendererOptions};
pub use renderer::{ComponentRenderer, MarkupRenderer, RenderStream, Renderer};
pub use resolver::{ModuleResolver, Resolution};
pub use runtime::SandboxConfig;
pub use sandbox::{BundleRunner, ContextReuseMode};
pub use sanitize::sanitize_context_data;
pub use source_map::SourceMapConsumers;
pub use template::{parse_template, ParsedTemplate, RenderEvent, TemplateRenderer, TemplateSource};
