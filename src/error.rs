/// Errors surfaced by the tracer constructors and polling loops.
///
/// Constructor failures ([`Error::LimitFailed`], [`Error::LoadFailed`])
/// abort initialization; everything acquired up to that point is
/// released by drop order. Per-tick drain failures are logged and never
/// returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open, load, or attach BPF object: {0}")]
    LoadFailed(String),

    #[error("failed to raise RLIMIT_MEMLOCK: {0}")]
    LimitFailed(#[source] std::io::Error),

    #[error("failed to initialize UDP port bindings: {0}")]
    InitFailed(String),

    #[error("batched map drain failed: {0}")]
    DrainFailed(#[source] std::io::Error),

    #[error("ring buffer polling failed: {0}")]
    PollFailed(String),
}
