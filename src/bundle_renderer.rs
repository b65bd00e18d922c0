//! Bundle renderer: run the bundle for a request, then render what it
//! produced.

use std::rc::Rc;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::bundle::{Bundle, BundleSource};
use crate::context::RenderContext;
use crate::error::Result;
use crate::manifest::Resource;
use crate::ops::ConsoleOutput;
use crate::options::RendererOptions;
use crate::renderer::{ComponentRenderer, MarkupRenderer, RenderStream, Renderer};
use crate::sandbox::BundleRunner;
use crate::source_map::SourceMapConsumers;
use crate::template::EventHub;

/// Renders a server bundle per request.
///
/// Errors raised by bundle code have their stack traces mapped back to the
/// original sources before they are returned or yielded.
pub struct BundleRenderer {
    runner: Rc<BundleRunner>,
    renderer: Renderer,
    maps: SourceMapConsumers,
}

impl BundleRenderer {
    pub fn new(bundle: impl Into<BundleSource>, options: RendererOptions) -> Result<Self> {
        Self::with_component_renderer(bundle, options, Arc::new(MarkupRenderer))
    }

    pub fn with_component_renderer(
        bundle: impl Into<BundleSource>,
        options: RendererOptions,
        components: Arc<dyn ComponentRenderer>,
    ) -> Result<Self> {
        let bundle = Bundle::load(bundle, options.basedir.clone())?;
        let renderer = Renderer::with_component_renderer(&options, components)?;
        let runner = BundleRunner::new(
            &bundle,
            options.context_reuse_mode,
            options.production,
            &options.sandbox,
        )?;
        let maps = SourceMapConsumers::new(&bundle.maps);

        Ok(Self {
            runner: Rc::new(runner),
            renderer,
            maps,
        })
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Render one request to a complete document.
    pub async fn render_to_string(&self, context: &mut RenderContext) -> Result<String> {
        let result = match self.runner.run(context).await {
            Ok(component) => self.renderer.render_to_string(&component, context),
            Err(error) => Err(error),
        };
        match result {
            Err(mut error) => {
                self.maps.rewrite_error_trace(&mut error).await;
                tracing::debug!("bundle render failed: {}", error);
                Err(error)
            }
            ok => ok,
        }
    }

    /// [`Self::render_to_string`], delivering the outcome to `callback`.
    pub async fn render_to_string_with<F>(&self, context: &mut RenderContext, callback: F)
    where
        F: FnOnce(Result<String>),
    {
        callback(self.render_to_string(context).await);
    }

    /// Render one request as a stream. Nothing runs until it is polled.
    pub fn render_to_stream(&self, mut context: RenderContext) -> RenderStream {
        let events = EventHub::default();
        let runner = self.runner.clone();
        let renderer = self.renderer.clone();
        let hub = events.clone();

        let output = stream::once(async move {
            match runner.run(&mut context).await {
                Ok(component) => renderer.compose(component, context, hub),
                Err(error) => stream::iter([Err(error)]).boxed_local(),
            }
        })
        .flatten();

        let maps = self.maps.clone();
        let inner = output
            .then(move |item| {
                let maps = maps.clone();
                async move {
                    match item {
                        Err(mut error) => {
                            maps.rewrite_error_trace(&mut error).await;
                            Err(error)
                        }
                        ok => ok,
                    }
                }
            })
            .boxed_local();

        RenderStream::new(inner, events)
    }

    /// Files to preload for a rendered request, e.g. for HTTP/2 push.
    pub fn preload_files(&self, context: &mut RenderContext) -> Vec<Resource> {
        self.renderer.preload_files(context)
    }

    /// Sandbox console output captured since the last call.
    pub async fn console(&self) -> ConsoleOutput {
        self.runner.take_console().await
    }
}
