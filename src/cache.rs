//! Existence-based memoization of expensive pipeline steps.

use tracing::{debug, info, Span};

use std::path::Path;


/// Decides whether a step has to run, based on whether all of its outputs exist.
///
/// A step is considered computed as soon as every output file exists, no matter what the files
/// contain. The only way to invalidate outputs is `force`.
#[derive(Debug, Clone)]
pub struct CacheGate {
    span: Span,
}

impl CacheGate {
    pub fn new(span: Span) -> CacheGate {
        CacheGate { span }
    }

    /// Returns `true` if `force` is set or any of the `outputs` is missing.
    ///
    /// `step` names the step in the log.
    pub fn should_run<P: AsRef<Path>>(&self, step: &str, outputs: &[P], force: bool) -> bool {
        let _entered = self.span.enter();
        if force {
            debug!(step = %step, "forced re-run");
            return true;
        }
        match outputs.iter().find(|p| !p.as_ref().exists()) {
            Some(missing) => {
                debug!(step = %step, missing = %missing.as_ref().display(), "output missing");
                true
            }
            None => {
                info!(step = %step, "outputs exist, skipping");
                false
            }
        }
    }
}
