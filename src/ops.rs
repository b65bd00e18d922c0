//! Ops backing the sandbox capability set.
//!
//! Console capture, base64 helpers, cancellable timers and the module
//! resolution hooks `require` goes through. Everything sandboxed code can
//! reach on the host goes through one of these.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use deno_core::{op2, CancelFuture, CancelHandle, OpState, Resource, ResourceId};

use crate::resolver::{ExternalResolver, ModuleResolver, Resolution};

// ============================================================================
// Console Output Capture
// ============================================================================

/// Captured console output from the sandboxed runtime
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    tracing::debug!(target: "sandbox", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    tracing::warn!(target: "sandbox", "{}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    tracing::warn!(target: "sandbox", "console.error: {}", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

/// Byte-level base64 for `Buffer`.
#[op2]
#[string]
pub fn op_base64_encode(#[buffer] data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Lenient like Node: whitespace is skipped, the URL-safe alphabet and
/// missing padding are accepted.
#[op2]
#[buffer]
pub fn op_base64_decode(#[string] data: &str) -> Result<Vec<u8>, Error> {
    use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
    use base64::{alphabet, Engine};

    const LENIENT: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    let normalized: String = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    LENIENT
        .decode(normalized)
        .map_err(|e| anyhow!("Invalid base64: {}", e))
}

// ============================================================================
// Timers
// ============================================================================

/// A pending timer. Closing the resource cancels the sleep behind it.
struct TimerHandle(Rc<CancelHandle>);

impl Resource for TimerHandle {
    fn name(&self) -> Cow<str> {
        "timer".into()
    }

    fn close(self: Rc<Self>) {
        self.0.cancel();
    }
}

/// Every timer still pending in the isolate, whichever scope armed it.
#[derive(Debug, Default)]
pub struct TimerRegistry(HashSet<ResourceId>);

#[op2(fast)]
#[smi]
pub fn op_timer_handle(state: &mut OpState) -> ResourceId {
    let rid = state
        .resource_table
        .add(TimerHandle(CancelHandle::new_rc()));
    state.borrow_mut::<TimerRegistry>().0.insert(rid);
    rid
}

/// Cancel one timer. Also releases the handle of a timer that fired.
#[op2(fast)]
pub fn op_timer_clear(state: &mut OpState, #[smi] rid: ResourceId) {
    state.borrow_mut::<TimerRegistry>().0.remove(&rid);
    state.resource_table.close(rid).ok();
}

/// Cancel every pending timer. Returns how many there were.
pub fn cancel_timers(state: &mut OpState) -> usize {
    let pending = std::mem::take(&mut state.borrow_mut::<TimerRegistry>().0);
    for rid in &pending {
        state.resource_table.close(*rid).ok();
    }
    pending.len()
}

/// Resolves `true` when the timer fires, `false` when it was cancelled.
#[op2(async)]
pub async fn op_sleep(
    state: Rc<RefCell<OpState>>,
    #[number] millis: u64,
    #[smi] rid: ResourceId,
) -> Result<bool, Error> {
    let handle = state.borrow().resource_table.get::<TimerHandle>(rid)?;
    let fired = tokio::time::sleep(Duration::from_millis(millis))
        .or_cancel(handle.0.clone())
        .await
        .is_ok();
    Ok(fired)
}

// ============================================================================
// Module Resolution
// ============================================================================

/// Per-runtime module state: the bundle's files and the external resolver.
pub struct BundleModules {
    pub virtual_files: ModuleResolver,
    pub external: ExternalResolver,
}

/// Resolve a `require` from `referrer`. Virtual referrers are bundle file
/// names; external referrers are absolute paths of host modules.
#[op2]
#[serde]
pub fn op_bundle_resolve(
    state: &mut OpState,
    #[string] request: &str,
    #[string] referrer: &str,
) -> Result<Resolution, Error> {
    let modules = state.borrow_mut::<BundleModules>();
    let referrer_path = Path::new(referrer);

    let path = if referrer_path.is_absolute() {
        modules.external.resolve(request, referrer_path.parent())?
    } else {
        match modules.virtual_files.resolve(request, referrer) {
            Resolution::Virtual(path) => return Ok(Resolution::Virtual(path)),
            Resolution::External(request) => modules.external.resolve_from_bundle(&request)?,
        }
    };
    Ok(Resolution::External(path.to_string_lossy().into_owned()))
}

#[op2]
#[string]
pub fn op_bundle_source(state: &mut OpState, #[string] path: &str) -> Result<String, Error> {
    state
        .borrow::<BundleModules>()
        .virtual_files
        .source(path)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("'{}' is not a bundle file", path))
}

#[op2]
#[string]
pub fn op_external_source(state: &mut OpState, #[string] path: &str) -> Result<String, Error> {
    let path = Path::new(path);
    if !state.borrow::<BundleModules>().external.was_resolved(path) {
        return Err(anyhow!("Access denied: {}", path.display()));
    }
    std::fs::read_to_string(path).map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))
}

deno_core::extension!(
    bundle_runner,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_btoa,
        op_atob,
        op_base64_encode,
        op_base64_decode,
        op_timer_handle,
        op_timer_clear,
        op_sleep,
        op_bundle_resolve,
        op_bundle_source,
        op_external_source,
    ],
);
