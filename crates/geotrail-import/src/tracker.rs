//! Elapsed-time and resident-memory sampling at run checkpoints.

use std::time::Instant;

/// Diagnostic tracker for one import run. Samples are emitted at `debug`
/// level; the tracker never influences control flow.
pub struct RunTracker {
    label: &'static str,
    started: Instant,
}

impl RunTracker {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self { label, started: Instant::now() }
    }

    /// Record a named checkpoint.
    pub fn checkpoint(&self, stage: &str) {
        let elapsed_ms = self.started.elapsed().as_millis();
        match resident_memory_kb() {
            Some(rss_kb) => {
                tracing::debug!(label = self.label, stage, elapsed_ms, rss_kb, "checkpoint");
            }
            None => tracing::debug!(label = self.label, stage, elapsed_ms, "checkpoint"),
        }
    }

    /// Milliseconds since the tracker was created.
    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Resident set size in kilobytes, when the platform exposes it.
#[must_use]
pub fn resident_memory_kb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                return rest.trim().trim_end_matches("kB").trim().parse().ok();
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
