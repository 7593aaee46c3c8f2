//! Who allocated this? Optional per-allocation call-context capture.
//!
//! Walking and symbolising the stack costs far more than the allocation it is
//! attached to, which is why this is off unless
//! [`crate::config::Config::caller_info_monitoring`] is set.
//!
//! Trails are interned: a thousand allocations from the same call path share
//! one [`CallerTrail`].

use std::{fmt, sync::Arc, thread};

use ahash::RandomState;
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::Serialize;

pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Symbol prefixes that belong to the tracking machinery itself (or to the
/// unwinder), and so never show up in a trail
const INTERNAL_PREFIXES: &[&str] = &[
    "backtrace::",
    "std::backtrace",
    "memward::caller::",
    "memward::checker::",
    "memward::callsite::",
    "memward::global::",
    "memward::externc::",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallerFrame {
    /// Module (or type) path, e.g. `my_app::pool::Pool`
    pub component: String,
    /// Function name, e.g. `alloc`
    pub operation: String,
    /// `file:line`, or `<unknown>` without debug info
    pub location: String,
}

impl fmt::Display for CallerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.component.is_empty() {
            write!(f, "{} ({})", self.operation, self.location)
        } else {
            write!(f, "{}::{} ({})", self.component, self.operation, self.location)
        }
    }
}

/// Innermost frame first
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CallerTrail {
    frames: Vec<CallerFrame>,
}

impl CallerTrail {
    pub fn new(frames: Vec<CallerFrame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[CallerFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// What we attach to a live allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerInfo {
    /// Name of the allocating thread, or its id if it has no name
    pub thread: String,
    pub trail: Arc<CallerTrail>,
}

/// Split a demangled symbol into `(component, operation)` at the last `::`
/// that is not nested inside `<...>`.
///
/// `<a::B as c::D>::f` -> (`<a::B as c::D>`, `f`)
pub fn split_symbol(symbol: &str) -> (&str, &str) {
    let bytes = symbol.as_bytes();
    let mut depth = 0usize;
    let mut split = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    match split {
        Some(at) => (&symbol[..at], &symbol[at + 2..]),
        None => ("", symbol),
    }
}

/// `<memward::checker::ValidityChecker<_>>::f` counts too
pub fn is_internal(symbol: &str) -> bool {
    let symbol = symbol.trim_start_matches('<');
    INTERNAL_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
}

/// Drop internal frames and keep the first `depth` of what is left. `frames`
/// is innermost first, as `(symbol, location)`.
pub fn select_frames<I>(frames: I, depth: usize) -> Vec<CallerFrame>
where
    I: IntoIterator<Item = (String, String)>,
{
    frames
        .into_iter()
        .filter(|(symbol, _)| !is_internal(symbol))
        .take(depth)
        .map(|(symbol, location)| {
            let (component, operation) = split_symbol(&symbol);
            CallerFrame {
                component: component.to_owned(),
                operation: operation.to_owned(),
                location,
            }
        })
        .collect()
}

pub struct CallerInfoRecorder {
    max_depth: usize,
    interned: Mutex<HashSet<Arc<CallerTrail>, RandomState>>,
}

impl CallerInfoRecorder {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            interned: Mutex::new(HashSet::with_hasher(RandomState::new())),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Walk the current stack and build a [`CallerInfo`] for the calling
    /// thread
    pub fn capture(&self) -> CallerInfo {
        // Internal frames are skipped, so we may need to look a bit past
        // `max_depth` raw frames. This bounds how far.
        let budget = self.max_depth + 32;
        let mut raw = Vec::with_capacity(budget);
        backtrace::trace(|frame| {
            backtrace::resolve_frame(frame, |symbol| {
                let name = symbol
                    .name()
                    .map(|name| format!("{name:#}"))
                    .unwrap_or_else(|| "<unknown>".to_owned());
                let location = match (symbol.filename(), symbol.lineno()) {
                    (Some(file), Some(line)) => format!("{}:{line}", file.display()),
                    (Some(file), None) => file.display().to_string(),
                    _ => "<unknown>".to_owned(),
                };
                raw.push((name, location));
            });
            raw.len() < budget
        });

        let trail = CallerTrail::new(select_frames(raw, self.max_depth));
        CallerInfo {
            thread: current_thread_label(),
            trail: self.intern(trail),
        }
    }

    /// Number of distinct trails seen so far
    pub fn distinct_trails(&self) -> usize {
        self.interned.lock().len()
    }

    fn intern(&self, trail: CallerTrail) -> Arc<CallerTrail> {
        let mut interned = self.interned.lock();
        if let Some(existing) = interned.get(&trail) {
            return Arc::clone(existing);
        }
        let trail = Arc::new(trail);
        interned.insert(Arc::clone(&trail));
        trail
    }
}

fn current_thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", current.id()),
    }
}
