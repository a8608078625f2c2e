//! Executor-level scenarios: minimal arithmetic, a load/store round trip,
//! a kernel thunk trip, an atomic reservation, and interpreter/JIT
//! equivalence over the same block.

use std::sync::Mutex;

use ppc_cpu::{DispatchResult, KernelDispatch, ThreadState};
use xenon_arena::AccessMode;
use xenon_core::{Config, ExecutionMode, Executor};

/// `GuestArena` is a process-wide singleton (see `xenon_arena::GuestArena`):
/// only one may be reserved at a time. Every test in this file constructs
/// an `Executor` (and therefore an arena), so each must hold this lock for
/// as long as its `Executor` is alive to avoid racing the others under
/// `cargo test`'s default parallel execution.
static LOCK: Mutex<()> = Mutex::new(());

fn commit_code(exec: &Executor<ppc_cpu::NullDispatch>, addr: u32, words: &[u32]) {
    let region = exec.arena().reserve(addr, (words.len() as u64) * 4).expect("reserve");
    exec.arena().commit(region, AccessMode::ExecuteReadWrite).expect("commit");
    for (i, w) in words.iter().enumerate() {
        let ptr = exec.arena().translate(addr + (i as u32) * 4);
        unsafe { std::ptr::write_unaligned(ptr.cast::<u32>(), w.to_be()) };
    }
}

fn small_executor(mode: ExecutionMode) -> Executor<ppc_cpu::NullDispatch> {
    let config = Config { mode, arena_size: 1 << 20, verbose: false };
    Executor::new(ppc_cpu::NullDispatch, config).expect("executor")
}

fn encode_addi(rt: u32, ra: u32, simm: i16) -> u32 {
    (14 << 26) | (rt << 21) | (ra << 16) | (simm as u16 as u32)
}

fn encode_add(rt: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rt << 21) | (ra << 16) | (rb << 11) | (266 << 1)
}

fn encode_stw(rs: u32, ra: u32, d: i16) -> u32 {
    (36 << 26) | (rs << 21) | (ra << 16) | (d as u16 as u32)
}

fn encode_lwz(rt: u32, ra: u32, d: i16) -> u32 {
    (32 << 26) | (rt << 21) | (ra << 16) | (d as u16 as u32)
}

fn encode_lwbrx(rt: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rt << 21) | (ra << 16) | (rb << 11) | (534 << 1)
}

fn encode_lwarx(rt: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rt << 21) | (ra << 16) | (rb << 11) | (20 << 1)
}

fn encode_stwcx(rs: u32, ra: u32, rb: u32) -> u32 {
    (31 << 26) | (rs << 21) | (ra << 16) | (rb << 11) | (150 << 1) | 1
}

fn encode_bclr_always() -> u32 {
    (19 << 26) | (0b10100 << 21) | (16 << 1)
}

/// S1: minimal arithmetic.
#[test]
fn minimal_arithmetic_block_leaves_r3_at_ten() {
    let _guard = LOCK.lock().unwrap();
    let mut exec = small_executor(ExecutionMode::Interpreter);
    commit_code(
        &exec,
        0x1000,
        &[encode_addi(3, 0, 4), encode_addi(4, 0, 6), encode_add(3, 3, 4), encode_bclr_always()],
    );
    let t = exec.create_thread(0);
    exec.thread_mut(t).unwrap().lr = 0x9000;
    let executed = exec.execute(t, 0x1000, 3).expect("run");
    assert_eq!(executed, 3);
    assert_eq!(exec.thread(t).unwrap().r[3], 10);
}

/// S2: load/store round trip including a byte-reversed load.
#[test]
fn store_then_load_round_trips_through_guest_memory() {
    let _guard = LOCK.lock().unwrap();
    let mut exec = small_executor(ExecutionMode::Interpreter);
    commit_code(
        &exec,
        0x1000,
        &[
            encode_addi(3, 0, 0x1234),
            encode_stw(3, 0, 0x100),
            encode_lwz(4, 0, 0x100),
            encode_lwbrx(5, 0, 6),
            encode_bclr_always(),
        ],
    );
    // lwbrx r5, 0, r6 addresses off r6 alone (ra = 0); preset r6 below.
    let t = exec.create_thread(0);
    exec.thread_mut(t).unwrap().r[6] = 0x100;
    exec.thread_mut(t).unwrap().lr = 0x9000;
    exec.execute(t, 0x1000, 10).expect("run");
    let state = exec.thread(t).unwrap();
    assert_eq!(state.r[4], 0x1234);
    assert_eq!(state.r[5], 0x1234_0000);
}

/// S3: a thunk trip through a mock kernel dispatch.
struct MockDispatch;
impl KernelDispatch for MockDispatch {
    fn invoke(&mut self, state: &mut ThreadState, ordinal: u32) -> DispatchResult {
        if ordinal == 7 {
            state.r[3] = 99;
            DispatchResult::Ok
        } else {
            DispatchResult::Unimplemented
        }
    }
}

#[test]
fn thunk_trip_dispatches_exactly_once_and_returns_to_lr() {
    let _guard = LOCK.lock().unwrap();
    let config = Config { mode: ExecutionMode::Interpreter, arena_size: 1 << 20, verbose: false };
    let mut exec = Executor::new(MockDispatch, config).expect("executor");
    commit_code(&exec, 0x2000, &ppc_cpu::encode_thunk(7));
    exec.register_thunk(0x2000, 7);
    let t = exec.create_thread(0);
    exec.thread_mut(t).unwrap().lr = 0x9000;
    let executed = exec.execute(t, 0x2000, 1).expect("run");
    assert_eq!(executed, 1);
    let state = exec.thread(t).unwrap();
    assert_eq!(state.r[3], 99);
    assert_eq!(state.pc, 0x9000);
}

/// S6: lwarx/stwcx. round trip succeeds when nothing intervenes.
#[test]
fn reservation_round_trip_succeeds() {
    let _guard = LOCK.lock().unwrap();
    let mut exec = small_executor(ExecutionMode::Interpreter);
    commit_code(
        &exec,
        0x1000,
        &[encode_addi(3, 0, 0x4242), encode_lwarx(4, 0, 1), encode_stwcx(3, 0, 1), encode_bclr_always()],
    );
    let t = exec.create_thread(0);
    exec.thread_mut(t).unwrap().r[1] = 0x300;
    exec.thread_mut(t).unwrap().lr = 0x9000;
    exec.execute(t, 0x1000, 10).expect("run");
    let state = exec.thread(t).unwrap();
    assert!(state.cr.bit(2), "stwcx. must set CR0[EQ] on success");
}

/// Property 9: running the same bounded block under the interpreter and
/// under the JIT to its first `blr` produces identical final state.
#[test]
fn interpreter_and_jit_agree_on_final_register_state() {
    let _guard = LOCK.lock().unwrap();
    let words = [
        encode_addi(3, 0, 4),
        encode_addi(4, 0, 6),
        encode_add(3, 3, 4),
        encode_stw(3, 0, 0x100),
        encode_lwz(5, 0, 0x100),
        encode_bclr_always(),
    ];

    // `GuestArena` is a process-wide singleton, so the two executors can't
    // coexist: run the interpreter to completion, capture the state that
    // matters, then drop it before reserving the JIT executor's arena.
    let (interp_r, interp_pc) = {
        let mut interp_exec = small_executor(ExecutionMode::Interpreter);
        commit_code(&interp_exec, 0x1000, &words);
        let ti = interp_exec.create_thread(0);
        interp_exec.thread_mut(ti).unwrap().lr = 0x9000;
        interp_exec.execute(ti, 0x1000, 10).expect("interpreter run");
        let state = interp_exec.thread(ti).unwrap();
        (state.r, state.pc)
    };

    let mut jit_exec = small_executor(ExecutionMode::Jit);
    commit_code(&jit_exec, 0x1000, &words);
    let tj = jit_exec.create_thread(0);
    jit_exec.thread_mut(tj).unwrap().lr = 0x9000;
    jit_exec.execute(tj, 0x1000, 10).expect("jit run");

    let b = jit_exec.thread(tj).unwrap();
    assert_eq!(interp_r, b.r);
    assert_eq!(interp_pc, b.pc);
}
