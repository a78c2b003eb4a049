use log::{debug, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::analyzer::{AnalyzerError, AnalyzerResult, panic_message};
use crate::connection::Connection;
use crate::registry::AnalyzerRegistry;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("analyzer '{analyzer}' failed on connection {uid}: {source}")]
    Analyzer {
        analyzer: String,
        uid: u64,
        #[source]
        source: AnalyzerError,
    },

    #[error("analyzer '{analyzer}' panicked on connection {uid}: {message}")]
    Panicked {
        analyzer: String,
        uid: u64,
        message: String,
    },
}

/// Runs every registered analyzer against one connection at a time.
///
/// Cheap to clone; all workers share the same registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<AnalyzerRegistry>,
    slow_threshold: Option<Duration>,
}

impl Dispatcher {
    pub fn new(registry: Arc<AnalyzerRegistry>) -> Self {
        Dispatcher {
            registry,
            slow_threshold: None,
        }
    }

    /// Warn about analysis calls that take longer than `threshold`. Calls are
    /// never interrupted.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = Some(threshold);
        self
    }

    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.registry
    }

    /// Applies each analyzer whose filter matches, in registry order, and
    /// stores its result on the connection. Stops at the first failure; results
    /// stored before the failure stay on the record.
    pub fn dispatch(&self, conn: &mut Connection) -> Result<(), DispatchError> {
        for analyzer in self.registry.iter() {
            let name = analyzer.name();

            let matched = panic::catch_unwind(AssertUnwindSafe(|| analyzer.filter(conn)))
                .map_err(|payload| panicked(name, conn.uid(), payload))?;
            if !matched {
                continue;
            }

            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(conn)));
            self.check_elapsed(name, conn.uid(), started.elapsed());

            let result: AnalyzerResult = outcome
                .map_err(|payload| panicked(name, conn.uid(), payload))?
                .map_err(|source| DispatchError::Analyzer {
                    analyzer: name.to_string(),
                    uid: conn.uid(),
                    source,
                })?;

            debug!("{} -> {} on connection {}", name, result.key(), conn.uid());
            conn.record_result(result);
        }
        Ok(())
    }

    fn check_elapsed(&self, name: &str, uid: u64, elapsed: Duration) {
        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                warn!(
                    "Analyzer '{}' took {}ms on connection {} (threshold {}ms)",
                    name,
                    elapsed.as_millis(),
                    uid,
                    threshold.as_millis()
                );
            }
        }
    }
}

fn panicked(analyzer: &str, uid: u64, payload: Box<dyn Any + Send>) -> DispatchError {
    DispatchError::Panicked {
        analyzer: analyzer.to_string(),
        uid,
        message: panic_message(payload.as_ref()),
    }
}
