//! The agent core: context assembly, the regeneration loop, the cycle
//! state machine, and the queue that serializes cycle execution.

pub mod context;
pub mod cycle;
pub mod regen;
pub mod runner;

pub use context::ContextAssembler;
pub use cycle::CycleEngine;
pub use regen::RegenerationLoop;
pub use runner::{spawn_cycle_runner, CycleRunner};
