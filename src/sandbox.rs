//! Module sandbox executor: runs a bundle's entry for each render under one of
//! three context reuse strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::bundle::Bundle;
use crate::context::{Component, RenderContext, StyleCollection};
use crate::error::{RenderError, Result};
use crate::ops::ConsoleOutput;
use crate::runtime::{SandboxConfig, SandboxRuntime};
use crate::sanitize::sanitize_context_data;

/// How execution contexts are reused across renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextReuseMode {
    /// New isolated scope and full module graph evaluation per render.
    #[default]
    Fresh,
    /// One isolated scope, entry evaluated on the first render only.
    SharedOnce,
    /// The runtime's own global scope, entry evaluated on the first render
    /// only. No isolation between renders.
    SharedGlobal,
}

impl ContextReuseMode {
    /// Whether the entry is evaluated once and its export reused.
    pub fn is_shared(self) -> bool {
        !matches!(self, Self::Fresh)
    }

    fn strategy_name(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::SharedOnce => "once",
            Self::SharedGlobal => "global",
        }
    }
}

impl FromStr for ContextReuseMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(Self::Fresh),
            "shared-once" | "once" => Ok(Self::SharedOnce),
            "shared-global" | "global" => Ok(Self::SharedGlobal),
            other => Err(format!(
                "unknown context reuse mode '{other}' (expected fresh, shared-once or shared-global)"
            )),
        }
    }
}

impl fmt::Display for ContextReuseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fresh => "fresh",
            Self::SharedOnce => "shared-once",
            Self::SharedGlobal => "shared-global",
        })
    }
}

/// What the JS runner resolves every call with.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope {
    Ok {
        #[serde(default)]
        component: Value,
        #[serde(default)]
        context: Option<RenderContext>,
        #[serde(default)]
        styles: Option<StyleCollection>,
        #[serde(default)]
        evaluated: bool,
    },
    Error {
        error: JsFailure,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsFailure {
    Compile { file: String, message: String },
    Execution { message: String, stack: Option<String> },
    InvalidExport { found: String },
}

impl From<JsFailure> for RenderError {
    fn from(failure: JsFailure) -> Self {
        match failure {
            JsFailure::Compile { file, message } => Self::Compilation { file, message },
            JsFailure::Execution { message, stack } => Self::Execution { message, stack },
            JsFailure::InvalidExport { found } => Self::InvalidEntryExport { found },
        }
    }
}

struct RunnerState {
    runtime: SandboxRuntime,
    /// Entry evaluated (shared strategies only).
    prepared: bool,
    /// Styles captured while evaluating the entry under a shared strategy.
    initial_styles: Option<StyleCollection>,
}

/// Executes a bundle inside its own sandboxed runtime.
///
/// Compiled module wrappers live as long as the runner. Evaluated modules
/// live as long as the execution context the strategy picks. Renders on one
/// runner take turns on the runtime.
pub struct BundleRunner {
    state: Mutex<RunnerState>,
    mode: ContextReuseMode,
    timeout_ms: Option<u64>,
}

impl BundleRunner {
    pub fn new(
        bundle: &Bundle,
        mode: ContextReuseMode,
        production: bool,
        config: &SandboxConfig,
    ) -> Result<Self> {
        let runtime = SandboxRuntime::new(config, bundle, mode.strategy_name(), production)?;
        tracing::debug!(
            "created {} bundle runner for '{}' ({} files)",
            mode,
            bundle.entry,
            bundle.files.len()
        );
        Ok(Self {
            state: Mutex::new(RunnerState {
                runtime,
                prepared: false,
                initial_styles: None,
            }),
            mode,
            timeout_ms: config.timeout_ms,
        })
    }

    pub fn mode(&self) -> ContextReuseMode {
        self.mode
    }

    /// Produce the component for one request, mutating `context` the way the
    /// bundle code did.
    pub async fn run(&self, context: &mut RenderContext) -> Result<Component> {
        let mut state = self.state.lock().await;

        if self.mode.is_shared() && !state.prepared {
            self.prepare(&mut state).await?;
        }

        context.registered_components.clear();
        context.mapped_files = None;
        if let Some(styles) = &state.initial_styles {
            // each request gets its own copy so mutations stay per request
            context.style_collection = Some(styles.clone());
        }

        let value = serde_json::to_value(&*context)
            .map_err(|e| RenderError::InvalidContext(e.to_string()))?;
        if let Value::Object(map) = &value {
            sanitize_context_data(map)?;
        }

        match self.call(&mut state.runtime, "render", &value.to_string()).await? {
            Envelope::Ok {
                component,
                context: returned,
                ..
            } => {
                if let Some(returned) = returned {
                    *context = returned;
                }
                Ok(Component(component))
            }
            Envelope::Error { error } => Err(error.into()),
        }
    }

    async fn prepare(&self, state: &mut RunnerState) -> Result<()> {
        match self.call(&mut state.runtime, "prepare", "null").await? {
            Envelope::Ok {
                styles, evaluated, ..
            } => {
                tracing::debug!("evaluated bundle entry once (evaluated={})", evaluated);
                state.initial_styles = styles.filter(|s| !s.is_empty());
                state.prepared = true;
                Ok(())
            }
            Envelope::Error { error } => Err(error.into()),
        }
    }

    async fn call(&self, runtime: &mut SandboxRuntime, method: &str, payload: &str) -> Result<Envelope> {
        let json = runtime.call(method, payload, self.timeout_ms).await?;
        serde_json::from_str(&json)
            .map_err(|e| RenderError::Runtime(format!("malformed runner response: {e}")))
    }

    /// Console output captured since the last call.
    pub async fn take_console(&self) -> ConsoleOutput {
        let mut state = self.state.lock().await;
        state.runtime.take_console()
    }
}
