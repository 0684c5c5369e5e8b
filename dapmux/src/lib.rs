/// DAP-to-GDB/MI debug adapter bridging an editor's Debug Adapter Protocol
/// client to a GDB/MI2 session driving a remote RISC-V simulator.
///
/// Module layout generalizes the teacher's flat `gdbadapter` crate (a
/// single `lib.rs` plus `parser`/`types`) into one module per concern:
/// the MI wire layer (`mi`), the DAP wire layer (`dap`), the command
/// pipeline that correlates tokens to replies (`pipeline`), the
/// execution state machine (`state`), breakpoint/variable-reference
/// bookkeeping (`breakpoints`), the assert-prompt side channel
/// (`assert`), stop recovery (`recovery`), request dispatch (`handler`),
/// process supervision (`lifecycle`), and the top-level wiring
/// (`session`).
pub mod assert;
pub mod breakpoints;
pub mod dap;
pub mod handler;
pub mod lifecycle;
pub mod mi;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod state;

pub use session::{Session, SessionError};
