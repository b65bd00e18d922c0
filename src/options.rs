//! Renderer configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::manifest::ClientManifest;
use crate::runtime::SandboxConfig;
use crate::sandbox::ContextReuseMode;
use crate::template::{TemplateSource, DEFAULT_PLACEHOLDER};

/// Decides per file whether a hint is emitted: `(file_without_query, as_type)`.
pub type FilePredicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Options shared by [`Renderer`](crate::Renderer) and
/// [`BundleRenderer`](crate::BundleRenderer).
#[derive(Clone)]
pub struct RendererOptions {
    /// Inject head metadata, resource hints, styles, state and scripts into
    /// the template automatically. When off, templates call the
    /// `renderResourceHints()`/`renderStyles()`/`renderState()`/
    /// `renderScripts()` helpers themselves.
    pub inject: bool,
    /// Document shell the rendered markup is placed into.
    pub template: Option<TemplateSource>,
    /// Marker in the template replaced by the rendered markup.
    pub content_placeholder: String,
    pub client_manifest: Option<ClientManifest>,
    /// Overrides the default of preloading scripts and styles only.
    pub should_preload: Option<FilePredicate>,
    pub should_prefetch: Option<FilePredicate>,
    /// Where external packages are resolved from.
    pub basedir: Option<PathBuf>,
    pub context_reuse_mode: ContextReuseMode,
    /// Production mode: `process.env.NODE_ENV` inside the sandbox and the
    /// self-removing state script.
    pub production: bool,
    pub sandbox: SandboxConfig,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            inject: true,
            template: None,
            content_placeholder: DEFAULT_PLACEHOLDER.to_string(),
            client_manifest: None,
            should_preload: None,
            should_prefetch: None,
            basedir: None,
            context_reuse_mode: ContextReuseMode::default(),
            production: false,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl std::fmt::Debug for RendererOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererOptions")
            .field("inject", &self.inject)
            .field("template", &self.template.is_some())
            .field("content_placeholder", &self.content_placeholder)
            .field("client_manifest", &self.client_manifest.is_some())
            .field("should_preload", &self.should_preload.is_some())
            .field("should_prefetch", &self.should_prefetch.is_some())
            .field("basedir", &self.basedir)
            .field("context_reuse_mode", &self.context_reuse_mode)
            .field("production", &self.production)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}
