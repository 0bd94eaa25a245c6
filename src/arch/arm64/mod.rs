//! AArch64 machine description: registers, the procedure call standard, and instructions.

pub mod regs;
pub mod calling_conv;
pub mod inst;

pub use regs::{PReg, PRegSet};
pub use calling_conv::MachineEnv;
pub use inst::{AMode, CallClobbers, Inst, Opcode, Operand, OperandKind, Reg, RegOperand};
