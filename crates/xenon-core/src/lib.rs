//! Executor facade.
//!
//! Owns the guest arena, the per-thread [`ThreadState`] vector, the
//! interpreter, and the JIT backend, and exposes the one run loop callers
//! actually need: load a module, create a thread, run it to completion.
//!
//! The JIT path has to repeat the interpreter's thunk-shortcut check
//! (4.D.6) itself: [`lower`](ppc_aarch64_backend::lower) treats `sc` as an
//! unrecognized opcode and lowers it to a no-op, so a compiled block that
//! happens to contain one would silently swallow the kernel call. Rather
//! than duplicate the dispatch logic, the JIT loop below defers straight
//! to [`Interpreter::step`] whenever `pc` lands on a registered thunk, and
//! only asks the JIT backend to compile something once it's sure `pc`
//! isn't one.

pub mod config;
pub mod error;

pub use config::{Config, ExecutionMode};
pub use error::ExecutorError;

use ppc_aarch64_backend::JitBackend;
use ppc_cpu::{Interpreter, KernelDispatch, StepResult, ThreadState};
use xenon_arena::GuestArena;
use xex_loader::{DecompressOptions, LoadedModule};

/// Per-thread stack convention: thread `id`'s initial `r1` is
/// `0x7000_0000 - id * 0x10_0000`, leaving a megabyte of guest address
/// space between adjacent threads' stacks (4.G).
const STACK_BASE: u64 = 0x7000_0000;
const STACK_STRIDE: u64 = 0x10_0000;

pub struct Executor<D: KernelDispatch> {
    arena: GuestArena,
    interpreter: Interpreter<D>,
    jit: JitBackend,
    threads: Vec<ThreadState>,
    config: Config,
}

impl<D: KernelDispatch> Executor<D> {
    /// Reserves the guest arena at `config.arena_size` and wires the
    /// interpreter's memory access to it.
    ///
    /// # Errors
    ///
    /// Propagates [`xenon_arena::ArenaError`] if the reservation fails (in
    /// particular [`xenon_arena::ArenaError::AlreadyInitialized`] — only
    /// one `GuestArena` may live per process).
    pub fn new(dispatch: D, config: Config) -> Result<Self, ExecutorError> {
        let arena = GuestArena::initialize_with_size(config.arena_size)?;
        let mut interpreter = Interpreter::new(dispatch);
        interpreter.set_arena_base(arena.arena_base());
        Ok(Self {
            arena,
            interpreter,
            jit: JitBackend::new(),
            threads: Vec::new(),
            config,
        })
    }

    #[must_use]
    pub fn arena(&self) -> &GuestArena {
        &self.arena
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parses, decompresses, maps, and resolves imports for a XEX2 image
    /// already read into memory, installing its thunks into the shared
    /// thunk table the interpreter and JIT both consult.
    ///
    /// # Errors
    ///
    /// Propagates [`xex_loader::LoadError`].
    pub fn load_module(&mut self, data: &[u8], opts: DecompressOptions) -> Result<LoadedModule, ExecutorError> {
        let module = xex_loader::load_module(&self.arena, data, self.interpreter.thunks_mut(), opts)?;
        Ok(module)
    }

    /// Allocates a new hardware-thread context with its stack pointer set
    /// per the documented per-thread convention, and returns the index
    /// used to address it in every other method.
    pub fn create_thread(&mut self, id: u32) -> usize {
        let mut state = ThreadState::new(id);
        state.r[1] = STACK_BASE.wrapping_sub(u64::from(id) * STACK_STRIDE);
        self.threads.push(state);
        self.threads.len() - 1
    }

    #[must_use]
    pub fn thread(&self, index: usize) -> Option<&ThreadState> {
        self.threads.get(index)
    }

    pub fn thread_mut(&mut self, index: usize) -> Option<&mut ThreadState> {
        self.threads.get_mut(index)
    }

    pub fn register_thunk(&mut self, guest_addr: u32, ordinal: u32) {
        self.interpreter.register_thunk(guest_addr, ordinal);
    }

    pub fn set_kernel_dispatch(&mut self, dispatch: D) {
        self.interpreter.set_kernel_dispatch(dispatch);
    }

    /// Runs `thread` starting at `start_addr` for at most
    /// `max_instructions`, dispatching to the interpreter or the JIT per
    /// [`Config::mode`]. Returns the number of instructions actually
    /// executed, matching [`Interpreter::run`]'s own accounting.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::UnknownThread`] if `thread` wasn't
    /// returned by [`Self::create_thread`], or propagates a
    /// [`ppc_aarch64_backend::BackendError`] from a failed JIT compile.
    pub fn execute(&mut self, thread: usize, start_addr: u32, max_instructions: u64) -> Result<u64, ExecutorError> {
        let Self { arena, interpreter, jit, threads, config } = self;
        let state = threads.get_mut(thread).ok_or(ExecutorError::UnknownThread(thread))?;
        state.pc = start_addr;
        match config.mode {
            ExecutionMode::Interpreter => Ok(interpreter.run(state, max_instructions)),
            ExecutionMode::Jit => run_jit(jit, arena, interpreter, state, max_instructions),
        }
    }
}

/// JIT-mode run loop: identical shape to [`Interpreter::run`], except each
/// iteration either takes the thunk shortcut through the interpreter or
/// compiles/executes one basic block.
fn run_jit<D: KernelDispatch>(
    jit: &mut JitBackend,
    arena: &GuestArena,
    interpreter: &mut Interpreter<D>,
    state: &mut ThreadState,
    max_instructions: u64,
) -> Result<u64, ExecutorError> {
    state.running = true;
    let mut executed = 0u64;
    while state.running && executed < max_instructions {
        if interpreter.thunks().ordinal_at(state.pc).is_some() {
            executed += 1;
            match interpreter.step(state) {
                StepResult::Continue | StepResult::Branched => {}
                StepResult::Return
                | StepResult::KernelUnimplemented(_)
                | StepResult::IllegalInstruction(_)
                | StepResult::Trap => state.running = false,
                StepResult::Halted => break,
            }
            continue;
        }

        let block = jit.compile_or_get_from_arena(state.pc, arena)?;
        executed += u64::from(block.guest_size / 4).max(1);
        // SAFETY: `arena`'s base pointer and `state` both stay valid for
        // the call's duration; the block's bytes are only ever evicted by
        // `JitBackend::invalidate`, which we haven't called concurrently.
        unsafe {
            block.call(arena.arena_base(), state);
        }
        if block.terminates_in_return {
            state.running = false;
        }
    }
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppc_cpu::{DispatchResult, NullDispatch};
    use std::sync::Mutex;

    // `GuestArena::initialize_with_size` is process-wide and single-instance
    // (see `xenon_arena::GuestArena`), so tests that construct an `Executor`
    // must not run concurrently.
    static LOCK: Mutex<()> = Mutex::new(());

    fn small_executor(mode: ExecutionMode) -> Executor<NullDispatch> {
        let config = Config { mode, arena_size: 1 << 20, verbose: false };
        Executor::new(NullDispatch, config).expect("executor")
    }

    fn commit_code(exec: &Executor<NullDispatch>, addr: u32, words: &[u32]) {
        let region = exec.arena().reserve(addr, (words.len() as u64) * 4).expect("reserve");
        exec.arena().commit(region, xenon_arena::AccessMode::ExecuteReadWrite).expect("commit");
        for (i, w) in words.iter().enumerate() {
            let ptr = exec.arena().translate(addr + (i as u32) * 4);
            unsafe { std::ptr::write_unaligned(ptr.cast::<u32>(), w.to_be()) };
        }
    }

    fn encode_addi(rt: u32, ra: u32, simm: i16) -> u32 {
        (14 << 26) | (rt << 21) | (ra << 16) | (simm as u16 as u32)
    }

    fn encode_bclr_always() -> u32 {
        (19 << 26) | (0b10100 << 21) | (16 << 1)
    }

    #[test]
    fn create_thread_sets_conventional_stack_pointer() {
        let _guard = LOCK.lock().unwrap();
        let mut exec = small_executor(ExecutionMode::Interpreter);
        let t0 = exec.create_thread(0);
        let t1 = exec.create_thread(1);
        assert_eq!(exec.thread(t0).unwrap().r[1], 0x7000_0000);
        assert_eq!(exec.thread(t1).unwrap().r[1], 0x7000_0000 - 0x10_0000);
    }

    #[test]
    fn interpreter_mode_runs_a_minimal_block() {
        let _guard = LOCK.lock().unwrap();
        let mut exec = small_executor(ExecutionMode::Interpreter);
        commit_code(&exec, 0x1000, &[encode_addi(3, 0, 10), encode_bclr_always()]);
        let t = exec.create_thread(0);
        exec.execute(t, 0x1000, 10).expect("run");
        assert_eq!(exec.thread(t).unwrap().r[3], 10);
    }

    #[test]
    fn jit_mode_runs_the_same_minimal_block() {
        let _guard = LOCK.lock().unwrap();
        let mut exec = small_executor(ExecutionMode::Jit);
        commit_code(&exec, 0x1000, &[encode_addi(3, 0, 10), encode_bclr_always()]);
        let t = exec.create_thread(0);
        exec.execute(t, 0x1000, 10).expect("run");
        assert_eq!(exec.thread(t).unwrap().r[3], 10);
    }

    #[test]
    fn jit_mode_takes_the_thunk_shortcut() {
        struct Mock;
        impl KernelDispatch for Mock {
            fn invoke(&mut self, state: &mut ThreadState, ordinal: u32) -> DispatchResult {
                if ordinal == 42 {
                    state.r[3] = 99;
                    DispatchResult::Ok
                } else {
                    DispatchResult::Unimplemented
                }
            }
        }
        let _guard = LOCK.lock().unwrap();
        let config = Config { mode: ExecutionMode::Jit, arena_size: 1 << 20, verbose: false };
        let mut exec = Executor::new(Mock, config).expect("executor");
        commit_code(&exec, 0x1000, &ppc_cpu::encode_thunk(42));
        exec.register_thunk(0x1000, 42);
        let t = exec.create_thread(0);
        exec.thread_mut(t).unwrap().lr = 0x2000;
        exec.execute(t, 0x1000, 1).expect("run");
        assert_eq!(exec.thread(t).unwrap().r[3], 99);
        assert_eq!(exec.thread(t).unwrap().pc, 0x2000);
    }
}
