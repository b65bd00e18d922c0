//! Document shell templates and the composition of rendered markup into them.

mod parse;
mod renderer;
mod stream;

pub use parse::{
    escape_html, parse_template, CompiledTemplate, Expression, Helper, ParsedTemplate,
    TemplateScope, TemplateSource, DEFAULT_PLACEHOLDER,
};
pub use renderer::{serialize_state, BoundContext, TemplateRenderer};
pub use stream::{EventHub, RenderEvent, Sink, TemplateStream};
