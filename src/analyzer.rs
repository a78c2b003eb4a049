use serde::{Serialize, Serializer};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

use crate::connection::Connection;

/// Bumped whenever the layout of `Analyzer`, `Connection` or
/// `AnalyzerDeclaration` changes in a way that breaks already built plugins.
pub const ANALYZER_ABI_VERSION: u32 = 2;

/// Version of this crate, compared against the one a plugin was built with.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compiler this crate was built with. Rust has no stable ABI, so a plugin
/// is only loaded when its copy of this crate reports the same compiler.
pub const RUSTC_VERSION: &str = env!("NIDS_RUSTC_VERSION");

/// Name of the static every plugin module exports through `declare_analyzer!`.
pub const DECLARATION_SYMBOL: &[u8] = b"NIDS_ANALYZER_DECLARATION\0";

/// A pluggable component that inspects connection records.
///
/// Instances are shared read-only between worker threads once the registry is
/// finalized, hence the `Send + Sync` bound.
pub trait Analyzer: Send + Sync {
    /// Human readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Decides whether `analyze` should run for this connection. Must not have
    /// observable side effects.
    fn filter(&self, conn: &Connection) -> bool;

    /// Produces a keyed finding. Analyzers that have nothing to report should
    /// return `AnalyzerResult::idle(..)` rather than an error.
    fn analyze(&self, conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError>;
}

/// Failure reported by an analyzer for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct AnalyzerError(pub String);

impl AnalyzerError {
    pub fn new(msg: impl Into<String>) -> Self {
        AnalyzerError(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

/// What an analyzer found. Serialized with a `kind` tag so every entry in the
/// record log is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// The analyzer ran but had nothing to say.
    Idle,
    Alert { severity: Severity, message: String },
    Data { value: serde_json::Value },
}

/// A finding together with the key it is stored under in
/// `Connection::analyzers`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerResult {
    key: String,
    finding: Finding,
}

impl AnalyzerResult {
    pub fn new(key: impl Into<String>, finding: Finding) -> Self {
        AnalyzerResult {
            key: key.into(),
            finding,
        }
    }

    pub fn idle(key: impl Into<String>) -> Self {
        Self::new(key, Finding::Idle)
    }

    pub fn alert(key: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self::new(
            key,
            Finding::Alert {
                severity,
                message: message.into(),
            },
        )
    }

    pub fn data(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(key, Finding::Data { value })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn finding(&self) -> &Finding {
        &self.finding
    }
}

// The key is already the map key in the serialized record, so only the
// finding is written out.
impl Serialize for AnalyzerResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.finding.serialize(serializer)
    }
}

/// Exported by every plugin module under `DECLARATION_SYMBOL`.
pub struct AnalyzerDeclaration {
    pub abi_version: u32,
    pub core_version: &'static str,
    pub rustc_version: &'static str,
    /// Returns the panic message if the plugin's constructor panicked.
    pub constructor: fn() -> Result<Box<dyn Analyzer>, String>,
}

/// Text of a panic payload caught with `catch_unwind`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

thread_local! {
    // Set when a wrapped filter panicked; consumed by the `analyze` call the
    // dispatcher makes next on the same thread.
    static FILTER_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Stops panics at the plugin boundary.
///
/// A plugin module carries its own copy of std, and an unwind that crosses
/// into the sensor aborts the process. `declare_analyzer!` wraps every plugin
/// analyzer in this type so the unwind is caught on the plugin's side and
/// handed back as an `AnalyzerError`. A panicking `filter` reports a match so
/// that the following `analyze` call can return the error.
pub struct PanicBoundary<A> {
    inner: A,
}

impl<A: Analyzer> PanicBoundary<A> {
    pub fn new(inner: A) -> Self {
        PanicBoundary { inner }
    }
}

impl<A: Analyzer> Analyzer for PanicBoundary<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn filter(&self, conn: &Connection) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.inner.filter(conn))) {
            Ok(matched) => matched,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                FILTER_PANIC.with(|p| *p.borrow_mut() = Some(message));
                true
            }
        }
    }

    fn analyze(&self, conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError> {
        if let Some(message) = FILTER_PANIC.with(|p| p.borrow_mut().take()) {
            return Err(AnalyzerError::new(format!("filter panicked: {}", message)));
        }
        panic::catch_unwind(AssertUnwindSafe(|| self.inner.analyze(conn))).unwrap_or_else(
            |payload| {
                Err(AnalyzerError::new(format!(
                    "analyze panicked: {}",
                    panic_message(payload.as_ref())
                )))
            },
        )
    }
}

/// Exports an analyzer from a plugin crate built as a `cdylib`.
///
/// ```ignore
/// struct PayloadSize;
/// impl nids_v2::Analyzer for PayloadSize { /* ... */ }
///
/// fn new_analyzer() -> PayloadSize { PayloadSize }
///
/// nids_v2::declare_analyzer!(new_analyzer);
/// ```
#[macro_export]
macro_rules! declare_analyzer {
    ($constructor:path) => {
        #[unsafe(no_mangle)]
        pub static NIDS_ANALYZER_DECLARATION: $crate::AnalyzerDeclaration =
            $crate::analyzer_declaration!($constructor);
    };
}

/// Builds the `AnalyzerDeclaration` value `declare_analyzer!` exports.
#[doc(hidden)]
#[macro_export]
macro_rules! analyzer_declaration {
    ($constructor:path) => {{
        fn construct()
        -> ::std::result::Result<::std::boxed::Box<dyn $crate::Analyzer>, ::std::string::String>
        {
            ::std::panic::catch_unwind(|| {
                let analyzer: ::std::boxed::Box<dyn $crate::Analyzer> =
                    ::std::boxed::Box::new($crate::PanicBoundary::new($constructor()));
                analyzer
            })
            .map_err(|payload| $crate::panic_message(payload.as_ref()))
        }

        $crate::AnalyzerDeclaration {
            abi_version: $crate::ANALYZER_ABI_VERSION,
            core_version: $crate::CORE_VERSION,
            rustc_version: $crate::RUSTC_VERSION,
            constructor: construct,
        }
    }};
}
