//! Typed executor failures.

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Arena(#[from] xenon_arena::ArenaError),
    #[error(transparent)]
    Load(#[from] xex_loader::LoadError),
    #[error(transparent)]
    Compile(#[from] ppc_aarch64_backend::BackendError),
    #[error("no thread at index {0}")]
    UnknownThread(usize),
}
