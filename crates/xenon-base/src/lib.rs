//! Observability primitives shared across the workspace.
//!
//! Every major component (`ThreadState`, the code cache, the loader's
//! output module) exposes its internal state for inspection through the
//! same small contract. Queries never affect emulation state.

mod observable;

pub use observable::{Observable, Value};
