//! Component rendering facade: buffered and streamed rendering of a component
//! value into a document.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, LocalBoxStream, Stream, StreamExt};
use serde_json::Value;

use crate::context::{Component, RenderContext};
use crate::error::{RenderError, Result};
use crate::manifest::Resource;
use crate::options::RendererOptions;
use crate::template::{EventHub, RenderEvent, TemplateRenderer, TemplateStream};

/// Turns a component value into markup.
pub trait ComponentRenderer {
    fn render_to_string(&self, component: &Component, context: &RenderContext) -> Result<String>;

    /// Markup in chunks, as soon as each is ready. Defaults to a single
    /// chunk from [`Self::render_to_string`].
    fn render_to_stream(
        &self,
        component: Component,
        context: &RenderContext,
    ) -> LocalBoxStream<'static, Result<String>> {
        let rendered = self.render_to_string(&component, context);
        stream::iter([rendered]).boxed_local()
    }
}

/// Components that already are markup: a string, or an array of string
/// chunks. `null` renders nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupRenderer;

impl MarkupRenderer {
    fn chunks(component: &Component) -> Result<Vec<String>> {
        match component.as_value() {
            Value::Null => Ok(Vec::new()),
            Value::String(markup) => Ok(vec![markup.clone()]),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        RenderError::Render(format!("markup chunk must be a string, got {item}"))
                    })
                })
                .collect(),
            other => Err(RenderError::Render(format!(
                "expected markup string or array of markup chunks, got {other}"
            ))),
        }
    }
}

impl ComponentRenderer for MarkupRenderer {
    fn render_to_string(&self, component: &Component, _context: &RenderContext) -> Result<String> {
        Ok(Self::chunks(component)?.concat())
    }

    fn render_to_stream(
        &self,
        component: Component,
        _context: &RenderContext,
    ) -> LocalBoxStream<'static, Result<String>> {
        match Self::chunks(&component) {
            Ok(chunks) => stream::iter(chunks.into_iter().filter(|c| !c.is_empty()).map(Ok)).boxed_local(),
            Err(error) => stream::iter([Err(error)]).boxed_local(),
        }
    }
}

/// A streamed render. Pull it to drive the render; drop it to abandon the
/// rest of the work.
///
/// A failure is yielded as the last item; chunks yielded before it stay
/// valid.
pub struct RenderStream {
    inner: LocalBoxStream<'static, Result<String>>,
    events: EventHub,
}

impl RenderStream {
    pub(crate) fn new(inner: LocalBoxStream<'static, Result<String>>, events: EventHub) -> Self {
        Self { inner, events }
    }

    /// Listen for [`RenderEvent`]s. Register before polling to see them all.
    pub fn on_event(&self, listener: impl FnMut(RenderEvent) + 'static) {
        self.events.subscribe(listener);
    }

    /// Drain the stream into one string.
    pub async fn into_string(mut self) -> Result<String> {
        let mut html = String::new();
        while let Some(chunk) = self.next().await {
            html.push_str(&chunk?);
        }
        Ok(html)
    }
}

impl Stream for RenderStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct Composition {
    content: LocalBoxStream<'static, Result<String>>,
    composer: Option<TemplateStream>,
    pending: VecDeque<String>,
    events: EventHub,
    done: bool,
}

/// Renders components, placing the markup into the configured template.
#[derive(Clone)]
pub struct Renderer {
    template: Arc<TemplateRenderer>,
    components: Arc<dyn ComponentRenderer>,
}

impl Renderer {
    pub fn new(options: &RendererOptions) -> Result<Self> {
        Self::with_component_renderer(options, Arc::new(MarkupRenderer))
    }

    pub fn with_component_renderer(
        options: &RendererOptions,
        components: Arc<dyn ComponentRenderer>,
    ) -> Result<Self> {
        Ok(Self {
            template: Arc::new(TemplateRenderer::new(options)?),
            components,
        })
    }

    pub fn template_renderer(&self) -> &TemplateRenderer {
        &self.template
    }

    /// Files to preload for this render, e.g. for HTTP/2 push.
    pub fn preload_files(&self, context: &mut RenderContext) -> Vec<Resource> {
        self.template.preload_files(context)
    }

    pub fn render_to_string(&self, component: &Component, context: &mut RenderContext) -> Result<String> {
        let content = self.components.render_to_string(component, context)?;
        if self.template.template().is_some() {
            self.template.render_sync(&content, context)
        } else {
            Ok(content)
        }
    }

    pub fn render_to_string_with<F>(&self, component: &Component, context: &mut RenderContext, callback: F)
    where
        F: FnOnce(Result<String>),
    {
        callback(self.render_to_string(component, context));
    }

    pub fn render_to_stream(&self, component: Component, context: RenderContext) -> RenderStream {
        let events = EventHub::default();
        let inner = self.compose(component, context, events.clone());
        RenderStream::new(inner, events)
    }

    /// Pull-based pipeline: markup chunks flow through the template composer
    /// one at a time, so at most one chunk's worth of output is buffered.
    pub(crate) fn compose(
        &self,
        component: Component,
        context: RenderContext,
        events: EventHub,
    ) -> LocalBoxStream<'static, Result<String>> {
        let content = self.components.render_to_stream(component, &context);
        let composer = match self.template.template() {
            Some(template) => Some(TemplateStream::new(
                self.template.clone(),
                template.clone(),
                context,
                events.clone(),
            )),
            None => None,
        };
        let state = Composition {
            content,
            composer,
            pending: VecDeque::new(),
            events,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }
                match state.content.next().await {
                    Some(Ok(chunk)) => match &mut state.composer {
                        Some(composer) => composer.write(chunk, &mut state.pending),
                        None => state.pending.push_back(chunk),
                    },
                    Some(Err(error)) => {
                        state.done = true;
                        return Some((Err(error), state));
                    }
                    None => {
                        state.done = true;
                        state.events.emit(RenderEvent::AfterRender);
                        if let Some(composer) = &mut state.composer {
                            composer.end(&mut state.pending);
                        }
                    }
                }
            }
        })
        .boxed_local()
    }
}
