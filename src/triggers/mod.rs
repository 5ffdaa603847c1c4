// =============================================================================
// Trigger Engine — event-driven wake signals for the control loops
// =============================================================================
//
// Replaces naive time-based polling: per-strategy hysteresis state machines
// sample the indicator engine on a fast internal tick and wake the reasoning
// loop only on armed transitions, with cooldown.

pub mod machine;
pub mod spec;
pub mod supervisor;

pub use machine::{MachineEvent, TriggerMachine, TriggerState};
pub use spec::{TriggerCondition, TriggerOp, TriggerSpec};
pub use supervisor::{spawn_strategy_supervisor, FiredTrigger, TriggerEvent, WakeKind};
