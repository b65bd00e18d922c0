//! JS host for bundle execution - one sandboxed V8 isolate per runner.
//!
//! Provides only the minimal APIs bundle code needs:
//! - console.log/warn/error (captured, not printed)
//! - setTimeout/setInterval/setImmediate (cancelled when a render settles)
//! - atob, btoa, Buffer
//! - process.env.NODE_ENV (synthetic, never the host environment)
//! - require() over the bundle's virtual files and resolved packages
//! - No fs, net, env, or other system access

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Error};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;

use crate::bundle::Bundle;
use crate::ops::{bundle_runner, cancel_timers, BundleModules, ConsoleOutput, TimerRegistry};
use crate::resolver::{ExternalResolver, ModuleResolver};

const RUNNER_SOURCE: &str = include_str!("runner.js");

/// Text every compiled module starts with. Module source follows it on the
/// same line, so line numbers in stacks match the file.
pub(crate) const MODULE_WRAPPER_PREFIX: &str = "(function (__sandbox__) { with (__sandbox__) { \
return function (exports, require, module, __filename, __dirname) {";

/// Limits for the sandboxed isolate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single render in milliseconds (None = unlimited)
    pub timeout_ms: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout_ms: None,
        }
    }
}

/// A sandboxed runtime with the module runner installed.
///
/// The runner's entry points are held as a handle, never as a global, so
/// bundle code that reaches the real global object cannot call them.
pub struct SandboxRuntime {
    runtime: JsRuntime,
    runner: v8::Global<v8::Object>,
    heap_exhausted: Arc<AtomicBool>,
}

impl SandboxRuntime {
    /// Create the isolate and configure the runner for `bundle`.
    pub fn new(
        config: &SandboxConfig,
        bundle: &Bundle,
        mode: &str,
        production: bool,
    ) -> Result<Self, Error> {
        // Configure V8 heap limits if specified
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![bundle_runner::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if config.max_heap_size.is_some() {
            let isolate = runtime.v8_isolate().thread_safe_handle();
            let exhausted = heap_exhausted.clone();
            runtime.add_near_heap_limit_callback(move |current, initial| {
                tracing::warn!(
                    "near heap limit: current={}MB, initial={}MB",
                    current / (1024 * 1024),
                    initial / (1024 * 1024)
                );
                exhausted.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
                // room for the terminated script to unwind instead of an OOM abort
                current * 2
            });
        }

        let modules = BundleModules {
            virtual_files: ModuleResolver::new(Arc::new(bundle.files.clone())),
            external: ExternalResolver::new(bundle.basedir.clone())?,
        };
        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(ConsoleOutput::default());
            op_state.put(TimerRegistry::default());
            op_state.put(modules);
        }

        let installed = runtime.execute_script("<bundle-runner>", RUNNER_SOURCE.to_string())?;
        let runner = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, &installed);
            let object = v8::Local::<v8::Object>::try_from(local)
                .map_err(|_| anyhow!("Bundle runner did not install"))?;
            v8::Global::new(scope, object)
        };

        let mut sandbox = Self {
            runtime,
            runner,
            heap_exhausted,
        };
        let options = serde_json::json!({
            "entry": bundle.entry,
            "mode": mode,
            "production": production,
            "wrapperPrefix": MODULE_WRAPPER_PREFIX,
        });
        sandbox.invoke("configure", &options.to_string())?;
        Ok(sandbox)
    }

    /// Call runner entry point `method` with `payload` (a JSON string). The
    /// result must be a string or a promise of one; the event loop is driven
    /// until it settles.
    ///
    /// Whatever way the call ends, no timer it scheduled survives it.
    pub async fn call(
        &mut self,
        method: &str,
        payload: &str,
        timeout_ms: Option<u64>,
    ) -> Result<String, Error> {
        let watchdog = timeout_ms
            .map(|ms| Watchdog::start(self.runtime.v8_isolate().thread_safe_handle(), ms));

        let result = self.call_inner(method, payload).await;

        let timed_out = watchdog.is_some_and(Watchdog::stop);
        let heap_exhausted = self.heap_exhausted.swap(false, Ordering::SeqCst);
        if timed_out || heap_exhausted {
            self.recover().await;
        }
        let cancelled = cancel_timers(&mut self.runtime.op_state().borrow_mut());
        if cancelled > 0 {
            tracing::debug!("cancelled {} timers left after '{}'", cancelled, method);
        }

        if heap_exhausted {
            return Err(anyhow!("Render exceeded the sandbox heap limit"));
        }
        match (result, timeout_ms) {
            (Err(_), Some(ms)) if timed_out => Err(anyhow!("Render timed out after {}ms", ms)),
            (result, _) => result,
        }
    }

    /// Bring a terminated isolate back into a usable state: lift the
    /// termination, cancel what the aborted script left scheduled, and let
    /// the runner undo what it could not clean up itself.
    async fn recover(&mut self) {
        self.runtime.v8_isolate().cancel_terminate_execution();
        cancel_timers(&mut self.runtime.op_state().borrow_mut());
        // cancelled sleeps resolve now instead of during the next render
        if let Err(e) = self
            .runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
        {
            tracing::debug!("draining terminated render: {}", e);
        }
        if let Err(e) = self.invoke("recover", "null") {
            tracing::warn!("bundle runner recovery failed: {}", e);
        }
    }

    async fn call_inner(&mut self, method: &str, payload: &str) -> Result<String, Error> {
        let result_global = self.invoke(method, payload)?;

        // Run event loop to handle any promises and timers
        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &result_global);

        if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
            match promise.state() {
                v8::PromiseState::Fulfilled => {
                    let result = promise.result(scope);
                    if result.is_string() {
                        Ok(result.to_rust_string_lossy(scope))
                    } else {
                        Err(anyhow!("Bundle runner must resolve to a string"))
                    }
                }
                v8::PromiseState::Rejected => {
                    let exception = promise.result(scope);
                    Err(anyhow!(
                        "Bundle runner threw: {}",
                        exception.to_rust_string_lossy(scope)
                    ))
                }
                v8::PromiseState::Pending => {
                    Err(anyhow!("Bundle runner returned unresolved promise"))
                }
            }
        } else if local.is_string() {
            Ok(local.to_rust_string_lossy(scope))
        } else {
            Err(anyhow!("Bundle runner must return a string"))
        }
    }

    /// Synchronously call `method` on the runner handle.
    fn invoke(&mut self, method: &str, payload: &str) -> Result<v8::Global<v8::Value>, Error> {
        let scope = &mut self.runtime.handle_scope();
        let runner = v8::Local::new(scope, &self.runner);
        let name = v8::String::new(scope, method)
            .ok_or_else(|| anyhow!("Invalid runner entry point '{}'", method))?;
        let function = runner
            .get(scope, name.into())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| anyhow!("Bundle runner has no '{}' entry point", method))?;
        let argument = v8::String::new(scope, payload)
            .ok_or_else(|| anyhow!("Payload for '{}' is too large", method))?;

        let scope = &mut v8::TryCatch::new(scope);
        match function.call(scope, runner.into(), &[argument.into()]) {
            Some(value) => Ok(v8::Global::new(scope, value)),
            None if scope.has_terminated() => Err(anyhow!("execution terminated")),
            None => {
                let message = match scope.exception() {
                    Some(exception) => exception.to_rust_string_lossy(scope),
                    None => "unknown exception".to_string(),
                };
                Err(anyhow!("Bundle runner threw: {}", message))
            }
        }
    }

    /// Take (and reset) the console output captured so far.
    pub fn take_console(&mut self) -> ConsoleOutput {
        std::mem::take(self.runtime.op_state().borrow_mut().borrow_mut::<ConsoleOutput>())
    }
}

/// Terminates the isolate unless stopped before the deadline. Lives on its
/// own thread: while script runs, V8 holds the thread the async runtime
/// would poll a timer on.
struct Watchdog {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<bool>,
}

impl Watchdog {
    fn start(isolate: v8::IsolateHandle, ms: u64) -> Self {
        let (stop, stopped) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            match stopped.recv_timeout(Duration::from_millis(ms)) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    isolate.terminate_execution();
                    true
                }
                _ => false,
            }
        });
        Self { stop, thread }
    }

    /// Whether the deadline passed and execution was terminated.
    fn stop(self) -> bool {
        self.stop.send(()).ok();
        self.thread.join().unwrap_or(false)
    }
}
