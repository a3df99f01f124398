//! Tracing hooks for the request lifecycle.
//!
//! Events go through `tracing`; subscribers (and any metrics exporter) are
//! the embedding binary's business.

use tracing::warn;

use prevega_core::warning::{Diagnostics, Warning};

/// Record `warning` and mirror it as a `warn!` event.
pub fn record_warning(diagnostics: &Diagnostics, warning: Warning) {
    warn!(
        kind = ?warning.kind,
        dataset = %warning.dataset_name,
        "{}",
        warning.message
    );
    diagnostics.record(warning);
}

/// One summary event per finished request.
pub fn emit_request_summary(sources: usize, evaluated: usize, warnings: usize) {
    tracing::info!(sources, evaluated, warnings, "pre-transform finished");
}
