//! Phase-boundary progress notifications.

use tracing::{info, warn};

/// Receives `(percent, message)` at each phase boundary. A failing sink never
/// fails the batch.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, message: &str) -> anyhow::Result<()>;
}

impl<F> ProgressSink for F
where
    F: Fn(u8, &str) -> anyhow::Result<()> + Send + Sync,
{
    fn report(&self, percent: u8, message: &str) -> anyhow::Result<()> {
        self(percent, message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _percent: u8, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs every notification at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, percent: u8, message: &str) -> anyhow::Result<()> {
        info!(target: "progress", percent, message);
        Ok(())
    }
}

/// Deliver a notification, logging and swallowing sink failures.
pub(crate) fn notify(sink: &dyn ProgressSink, percent: u8, message: &str) {
    if let Err(err) = sink.report(percent.min(100), message) {
        warn!(percent, message, error = %err, "progress notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closures_are_sinks_and_failures_are_swallowed() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, m: &str| -> anyhow::Result<()> {
            seen.lock().unwrap().push((p, m.to_string()));
            Ok(())
        };
        notify(&sink, 150, "done");
        assert_eq!(seen.lock().unwrap().as_slice(), &[(100, "done".to_string())]);

        let failing = |_: u8, _: &str| -> anyhow::Result<()> { anyhow::bail!("ui gone") };
        notify(&failing, 10, "catalogs");
    }
}
