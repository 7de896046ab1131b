//! Panic Recovery for Downstream Services
//!
//! Panics raised while a downstream service is polled are caught and
//! turned into a [`Fault`] describing where the panic happened. The
//! panic site is resolved by a pluggable [`Locate`] implementation.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Once},
    task::{Context, Poll},
};

use pin_project::pin_project;

/// Source file and line a panic was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    /// Function symbol, when resolved from a backtrace
    pub function: Option<String>,
}

impl SourceLocation {
    pub fn new<S: Into<String>>(file: S, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            function: None,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Raw details recorded by the panic hook while a recovery scope is active.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    /// Location reported by the panic itself
    pub site: Option<SourceLocation>,
    /// Panic message
    pub detail: String,
    /// Full backtrace text, only present if the locator requested one
    pub backtrace: Option<String>,
}

/// Resolves the [`SourceLocation`] of a captured panic.
pub trait Locate: Send + Sync {
    fn locate(&self, capture: &Capture) -> Option<SourceLocation>;

    /// Whether the panic hook must capture a backtrace for this locator.
    fn wants_backtrace(&self) -> bool {
        false
    }
}

/// Default [`Locate`] implementation using the location reported
/// by the panic itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicSite;

impl Locate for PanicSite {
    #[inline]
    fn locate(&self, capture: &Capture) -> Option<SourceLocation> {
        capture.site.clone()
    }
}

/// [`Locate`] implementation that walks the captured backtrace and picks
/// the first frame outside of the runtime machinery.
///
/// # Examples
///
/// ```
/// use actix_errorpages::{ErrorPages, PageRegistry, StackScan};
///
/// let pages = ErrorPages::new(PageRegistry::new())
///     .locator(StackScan::default().machinery("actix_web::"));
/// ```
#[derive(Debug, Clone)]
pub struct StackScan {
    skip: usize,
    depth: usize,
    machinery: Vec<String>,
}

impl Default for StackScan {
    fn default() -> Self {
        Self {
            skip: 3,
            depth: 16,
            machinery: [
                "std::",
                "core::",
                "alloc::",
                "rust_panic",
                "rust_begin_unwind",
                "__rust",
                "actix_errorpages::recover::install_hook",
                "actix_errorpages::recover::Guarded",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

impl StackScan {
    /// Number of innermost frames ignored before scanning.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Maximum number of frames scanned after skipping.
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Add another symbol prefix considered part of the machinery.
    pub fn machinery<S: Into<String>>(mut self, prefix: S) -> Self {
        self.machinery.push(prefix.into());
        self
    }

    fn is_machinery(&self, symbol: &str) -> bool {
        let symbol = symbol.trim_start_matches('<');
        self.machinery.iter().any(|prefix| symbol.starts_with(prefix))
    }
}

impl Locate for StackScan {
    fn locate(&self, capture: &Capture) -> Option<SourceLocation> {
        let backtrace = capture.backtrace.as_deref()?;
        parse_frames(backtrace)
            .into_iter()
            .skip(self.skip)
            .take(self.depth)
            .filter(|frame| frame.file.is_some())
            .find(|frame| !self.is_machinery(&frame.function))
            .map(|frame| SourceLocation {
                file: frame.file.unwrap_or_default(),
                line: frame.line,
                function: Some(frame.function),
            })
    }

    #[inline]
    fn wants_backtrace(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Frame {
    function: String,
    file: Option<String>,
    line: u32,
}

/// Strip the instruction address and crate disambiguators (`std[1f2e..]`)
/// that the full backtrace format adds to a symbol.
fn symbol_name(raw: &str) -> String {
    let raw = raw.trim();
    let raw = match raw.split_once(" - ") {
        Some((addr, name)) if addr.starts_with("0x") => name,
        _ => raw,
    };
    let mut name = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find('[') {
        let (before, after) = rest.split_at(open);
        name.push_str(before);
        match after[1..].find(']') {
            Some(close)
                if close >= 8 && after[1..=close].bytes().all(|b| b.is_ascii_hexdigit()) =>
            {
                rest = &after[close + 2..];
            }
            _ => {
                name.push('[');
                rest = &after[1..];
            }
        }
    }
    name.push_str(rest);
    name
}

/// Split the rendering of a [`Backtrace`] into frames, innermost first.
/// Inlined symbols are listed as their own frames.
fn parse_frames(backtrace: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for line in backtrace.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(at) = line.strip_prefix("at ") {
            let Some(frame) = frames.last_mut().filter(|f| f.file.is_none()) else {
                continue;
            };
            let mut parts = at.rsplitn(3, ':');
            let (_col, lineno, file) = (parts.next(), parts.next(), parts.next());
            if let (Some(file), Some(Ok(lineno))) = (file, lineno.map(str::parse::<u32>)) {
                frame.file = Some(file.to_owned());
                frame.line = lineno;
            }
            continue;
        }
        let function = match line.split_once(": ") {
            Some((idx, name)) if idx.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => line,
        };
        frames.push(Frame {
            function: symbol_name(function),
            file: None,
            line: 0,
        });
    }
    frames
}

/// Cut the path after the first occurrence of `marker`, if anything follows it.
pub(crate) fn trim_source(file: &str, marker: &str) -> String {
    if !marker.is_empty() {
        if let Some(pos) = file.find(marker) {
            let rest = &file[pos + marker.len()..];
            if !rest.is_empty() {
                return rest.to_owned();
            }
        }
    }
    file.to_owned()
}

/// Caught panic from a downstream service
#[derive(Debug, Clone)]
pub struct Fault {
    /// Panic message
    pub detail: String,
    pub location: Option<SourceLocation>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "panicked at {location}: {}", self.detail),
            None => write!(f, "panicked: {}", self.detail),
        }
    }
}

fn payload_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_owned();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "Box<dyn Any>".to_owned()
}

thread_local! {
    static ARMED: Cell<usize> = const { Cell::new(0) };
    static WANTS_BACKTRACE: Cell<bool> = const { Cell::new(false) };
    static CAPTURED: RefCell<Option<Capture>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install the capturing panic hook, chaining whatever hook was active.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) == 0 {
                return previous(info);
            }
            let site = info
                .location()
                .map(|loc| SourceLocation::new(loc.file(), loc.line()));
            let backtrace = WANTS_BACKTRACE
                .with(Cell::get)
                .then(|| Backtrace::force_capture().to_string());
            let capture = Capture {
                site,
                detail: payload_detail(info.payload()),
                backtrace,
            };
            CAPTURED.with(|c| *c.borrow_mut() = Some(capture));
        }));
    });
}

/// Report a panic that was raised and caught again inside a recovery scope.
fn report_caught(capture: &Capture) {
    let site = capture
        .site
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    tracing::warn!(
        "panic caught by the wrapped service at {site}: {}",
        capture.detail
    );
}

/// Marks the current thread as inside a recovery scope until dropped.
struct Armed {
    previous: bool,
}

impl Armed {
    fn enter(wants_backtrace: bool) -> Self {
        if ARMED.with(|a| a.replace(a.get() + 1)) == 0 {
            CAPTURED.with(|c| c.borrow_mut().take());
        }
        let previous = WANTS_BACKTRACE.with(|w| w.replace(wants_backtrace));
        Self { previous }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        WANTS_BACKTRACE.with(|w| w.set(self.previous));
        ARMED.with(|a| a.set(a.get().saturating_sub(1)));
    }
}

/// Shared recovery settings used to guard downstream futures.
#[derive(Clone)]
pub(crate) struct Recovery {
    pub(crate) locator: Arc<dyn Locate>,
    pub(crate) source_root: Option<String>,
}

impl Recovery {
    pub(crate) fn new(locator: Arc<dyn Locate>, source_root: Option<String>) -> Self {
        install_hook();
        Self {
            locator,
            source_root,
        }
    }

    /// Wrap a future so that any panic while polling it becomes a [`Fault`].
    pub(crate) fn guard<F: Future>(&self, inner: F) -> Guarded<F> {
        Guarded {
            inner,
            recovery: self.clone(),
        }
    }

    fn fault(&self, payload: Box<dyn Any + Send>) -> Fault {
        let capture = CAPTURED.with(|c| c.borrow_mut().take()).unwrap_or_default();
        let location = self.locator.locate(&capture).map(|mut loc| {
            if let Some(root) = self.source_root.as_deref() {
                loc.file = trim_source(&loc.file, root);
            }
            loc
        });
        Fault {
            detail: payload_detail(payload.as_ref()),
            location,
        }
    }
}

/// Future returned by [`Recovery::guard`]
#[pin_project]
pub(crate) struct Guarded<F> {
    #[pin]
    inner: F,
    recovery: Recovery,
}

impl<F: Future> Future for Guarded<F> {
    type Output = Result<F::Output, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let inner = this.inner;
        let result = {
            let _armed = Armed::enter(this.recovery.locator.wants_backtrace());
            panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx)))
        };
        match result {
            Ok(poll) => {
                if let Some(capture) = CAPTURED.with(|c| c.borrow_mut().take()) {
                    report_caught(&capture);
                }
                poll.map(Ok)
            }
            Err(payload) => Poll::Ready(Err(this.recovery.fault(payload))),
        }
    }
}
