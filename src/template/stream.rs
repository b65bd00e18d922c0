//! Incremental document composition around streamed application markup.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use crate::context::RenderContext;
use crate::manifest::Resource;

use super::parse::ParsedTemplate;
use super::renderer::{BoundContext, TemplateRenderer};

/// Lifecycle notifications of a streamed render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// The first markup chunk arrived; the head is about to be written.
    /// Carries the files worth pushing ahead of the document.
    BeforeStart { preload_files: Vec<Resource> },
    /// The component renderer produced its last chunk.
    AfterRender,
    /// Input ended; `started` tells whether any document was written.
    BeforeEnd { started: bool },
}

type Listener = Box<dyn FnMut(RenderEvent)>;

/// Listeners shared between a stream handle and the work producing it.
#[derive(Clone, Default)]
pub struct EventHub {
    listeners: Rc<RefCell<Vec<Listener>>>,
}

impl EventHub {
    pub fn subscribe(&self, listener: impl FnMut(RenderEvent) + 'static) {
        self.listeners.borrow_mut().push(Box::new(listener));
    }

    pub fn emit(&self, event: RenderEvent) {
        tracing::trace!("render event {:?}", event);
        for listener in self.listeners.borrow_mut().iter_mut() {
            listener(event.clone());
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

/// Where composed output goes.
pub trait Sink {
    fn push(&mut self, chunk: String);
}

impl Sink for VecDeque<String> {
    fn push(&mut self, chunk: String) {
        self.push_back(chunk);
    }
}

impl Sink for Vec<String> {
    fn push(&mut self, chunk: String) {
        Vec::push(self, chunk);
    }
}

impl Sink for String {
    fn push(&mut self, chunk: String) {
        self.push_str(&chunk);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
}

/// Two-state composer: nothing is written until the first markup chunk,
/// then head, hints and styles go out ahead of it; state, scripts and the
/// tail follow the last one.
pub struct TemplateStream {
    renderer: Arc<TemplateRenderer>,
    template: Arc<ParsedTemplate>,
    context: RenderContext,
    events: EventHub,
    phase: Phase,
}

impl TemplateStream {
    pub fn new(
        renderer: Arc<TemplateRenderer>,
        template: Arc<ParsedTemplate>,
        context: RenderContext,
        events: EventHub,
    ) -> Self {
        Self {
            renderer,
            template,
            context,
            events,
            phase: Phase::NotStarted,
        }
    }

    pub fn is_started(&self) -> bool {
        self.phase == Phase::Started
    }

    /// Relay one chunk of application markup.
    pub fn write(&mut self, chunk: String, sink: &mut dyn Sink) {
        if self.phase == Phase::NotStarted {
            let preload_files = self.renderer.preload_files(&mut self.context);
            self.events.emit(RenderEvent::BeforeStart { preload_files });
            self.start(sink);
        }
        emit(sink, chunk);
    }

    fn start(&mut self, sink: &mut dyn Sink) {
        self.phase = Phase::Started;
        let renderer = self.renderer.clone();
        let mut scope = BoundContext::new(&renderer, &mut self.context);

        emit(sink, self.template.head.render(&mut scope));
        if renderer.inject() {
            if let Some(head) = scope.context.head.clone() {
                emit(sink, head);
            }
            emit(sink, renderer.render_resource_hints(scope.context));
            emit(sink, renderer.render_styles(scope.context));
        }
        emit(sink, self.template.neck.render(&mut scope));
        if renderer.inject() {
            emit(sink, self.template.wrapper().0.to_string());
        }
    }

    /// Finish the document after the last markup chunk.
    pub fn end(&mut self, sink: &mut dyn Sink) {
        let started = self.is_started();
        self.events.emit(RenderEvent::BeforeEnd { started });
        if !started {
            return;
        }

        let renderer = self.renderer.clone();
        let mut scope = BoundContext::new(&renderer, &mut self.context);
        if renderer.inject() {
            emit(sink, self.template.wrapper().1.to_string());
            emit(sink, renderer.render_async_state(scope.context));
            emit(sink, renderer.render_state(scope.context));
            emit(sink, renderer.render_scripts(scope.context));
        }
        emit(sink, self.template.tail.render(&mut scope));
    }
}

fn emit(sink: &mut dyn Sink, chunk: String) {
    if !chunk.is_empty() {
        sink.push(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ClientManifest;
    use crate::options::RendererOptions;
    use serde_json::json;

    const TEMPLATE: &str = r#"<html><head><title>{{ title }}</title></head><body><div id="app"></div></body></html>"#;

    fn composer(inject: bool, context: RenderContext) -> (TemplateStream, Rc<RefCell<Vec<RenderEvent>>>) {
        let renderer = Arc::new(
            TemplateRenderer::new(&RendererOptions {
                inject,
                template: Some(TEMPLATE.into()),
                client_manifest: Some(
                    ClientManifest::from_json(
                        r#"{"publicPath":"/","all":["app.js"],"initial":["app.js"],"async":[],"modules":{}}"#,
                    )
                    .unwrap(),
                ),
                ..Default::default()
            })
            .unwrap(),
        );
        let events = EventHub::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        events.subscribe(move |event| log.borrow_mut().push(event));
        (renderer.create_stream(context, events).unwrap(), seen)
    }

    #[test]
    fn test_composes_around_chunks() {
        let mut ctx = RenderContext::new().with("title", "T");
        ctx.state = Some(json!({ "a": 1 }));
        let (mut stream, events) = composer(true, ctx);

        let mut out = Vec::new();
        stream.write("<p>".into(), &mut out);
        let before_start = RenderEvent::BeforeStart {
            preload_files: vec![Resource::new("app.js")],
        };
        assert_eq!(*events.borrow(), vec![before_start.clone()]);
        stream.write("hi</p>".into(), &mut out);
        stream.end(&mut out);

        assert_eq!(
            out,
            vec![
                "<html><head><title>T</title>",
                r#"<link rel="preload" href="/app.js" as="script">"#,
                "</head><body>",
                r#"<div id="app">"#,
                "<p>",
                "hi</p>",
                "</div>",
                r#"<script>window.__INITIAL_STATE__={"a":1}</script>"#,
                r#"<script src="/app.js" defer></script>"#,
                "</body></html>",
            ]
        );
        assert_eq!(
            *events.borrow(),
            vec![before_start, RenderEvent::BeforeEnd { started: true }]
        );
    }

    #[test]
    fn test_without_inject_only_template_regions() {
        let (mut stream, _) = composer(false, RenderContext::new().with("title", "T"));
        let mut out = String::new();
        stream.write("<p>hi</p>".into(), &mut out);
        stream.end(&mut out);
        assert_eq!(out, "<html><head><title>T</title></head><body><p>hi</p></body></html>");
    }

    #[test]
    fn test_empty_render_writes_nothing() {
        let (mut stream, events) = composer(true, RenderContext::new());
        let mut out = Vec::new();
        stream.end(&mut out);
        assert!(out.is_empty());
        assert_eq!(*events.borrow(), vec![RenderEvent::BeforeEnd { started: false }]);
    }

    #[test]
    fn test_output_is_deterministic() {
        let run = || {
            let mut ctx = RenderContext::new().with("title", "same");
            ctx.head = Some("<meta>".into());
            let (mut stream, _) = composer(true, ctx);
            let mut out = String::new();
            for chunk in ["<a>", "b", "</a>"] {
                stream.write(chunk.into(), &mut out);
            }
            stream.end(&mut out);
            out
        };
        assert_eq!(run(), run());
    }
}
