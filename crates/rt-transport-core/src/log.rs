//! `Log` capability (spec.md §9 design note): replaces a global logger with
//! something injected into `Transport` construction, taken by sessions at
//! construction time rather than reached for as ambient process-wide state.
//! The default implementation is a thin wrapper over `tracing`, matching
//! every other binary in the teacher repo — the injection point is new, the
//! underlying sink is not.

/// Structured log sink. Implementations must be cheap to call from inside
/// the transport's single logical execution context — never block.
pub trait Log: Send + Sync {
    fn debug(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Forwards to the `tracing` macros. Stateless, so it is trivially `Clone`
/// and cheap to share behind an `Arc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl Log for TracingLog {
    fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }
    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }
    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }
}

/// A silent sink, useful for tests that don't want log noise but still need
/// a capability to inject.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLog;

impl Log for NullLog {
    fn debug(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}
