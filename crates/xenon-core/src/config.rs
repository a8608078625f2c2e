//! Executor configuration.

/// Which backend [`crate::Executor::execute`] dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Interpreter,
    Jit,
}

/// Knobs the CLI and integration tests both construct directly rather
/// than through a builder; the set is small enough that a plain struct
/// with `Default` reads better than a builder would.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ExecutionMode,
    /// Guest arena reservation size in bytes. Tests that never touch more
    /// than a few pages of guest memory pass something far smaller than
    /// the production 4 GiB default so they don't need root or a
    /// generous `vm.max_map_count`.
    pub arena_size: u64,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Interpreter,
            arena_size: xenon_arena::ARENA_SIZE,
            verbose: false,
        }
    }
}
