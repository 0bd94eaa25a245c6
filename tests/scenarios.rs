//! End-to-end allocation of small hand-written functions.

mod common;

use colorra::analysis::{liveness::Liveness, loops::LoopInfo};
use colorra::arch::arm64::{AMode, CallClobbers, Inst, MachineEnv, Opcode, Operand, OperandKind, regs::*};
use colorra::regalloc::{InstOrigin, LrClass, RaError};
use colorra::{BlockId, RaOptions, RegClass, VCode, VReg, regalloc_vcode};

use common::{alloc_checked, count_origins, float, init_logging, int};

fn b(n: usize) -> BlockId { BlockId::new(n) }

fn load_at(v: VReg, off: i64) -> Inst { Inst::load(v, AMode::reg_off(SP, off)) }

fn store_at(v: VReg, off: i64) -> Inst { Inst::store(v, AMode::reg_off(SP, off)) }

fn no_locals() -> RaOptions { RaOptions { local_ra: false, ..RaOptions::default() } }

#[test]
fn straight_line_fits() {
  let mut code = VCode::default();
  let [a, bb, c, d, e] = [(); 5].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(a, 0));
  code.emit(load_at(bb, 8));
  code.emit(Inst::alu(Opcode::Add, c, a, bb));
  code.emit(load_at(d, 16));
  code.emit(Inst::alu(Opcode::Add, e, c, d));
  code.emit(Inst::mov(X0, e));
  code.emit(Inst::ret(&[X0]));
  code.finish_block();
  let env = MachineEnv::with_allocatable([X0, X1, X2, X3]);
  let out = alloc_checked(&code, &env, &no_locals());
  assert_eq!(out.stats.spilled_ranges, 0);
  assert_eq!((out.stats.reloads, out.stats.stores), (0, 0));
  for v in [a, bb, c, d, e] {
    let alloc = &out.allocs[&v];
    assert!(matches!(alloc.bucket, LrClass::Unconstrained | LrClass::UnconstrainedPref), "{v}: {:?}", alloc.bucket);
    assert!(alloc.pieces.iter().all(|p| p.1.is_some()));
  }
  // the copy into the return register disappears
  assert_eq!(out.allocs[&e].bucket, LrClass::UnconstrainedPref);
  assert_eq!(out.allocs[&e].pieces[0].1, Some(X0));
  assert_eq!(out.stats.identity_moves, 1);
  assert!(out.callee_saved_used.is_empty());
}

/// `g` is live across a loop whose body needs every register for its own temporaries.
fn busy_loop() -> (VCode, VReg, [VReg; 7]) {
  let mut code = VCode::default();
  let g = int(&mut code);
  let temps = [(); 7].map(|()| int(&mut code));
  let [t1, t2, t3, t4, t5, t6, t7] = temps;
  code.new_block();
  code.emit(load_at(g, 0));
  code.finish_block();
  code.new_block();
  code.emit(load_at(t1, 8));
  code.emit(load_at(t2, 16));
  code.emit(load_at(t3, 24));
  code.emit(load_at(t4, 32));
  code.emit(Inst::alu(Opcode::Add, t5, t1, t2));
  code.emit(Inst::alu(Opcode::Add, t6, t3, t4));
  code.emit(Inst::alu(Opcode::Add, t7, t5, t6));
  code.emit(store_at(t7, 40));
  code.emit(Inst::branch_nz(t7, b(1)));
  code.finish_block();
  code.new_block();
  code.emit(store_at(g, 48));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  for (x, y) in [(0, 1), (1, 1), (1, 2)] { code.add_edge(b(x), b(y)) }
  (code, g, temps)
}

#[test]
fn loop_pressure_spills_the_long_value() {
  let (code, g, temps) = busy_loop();
  let env = MachineEnv::with_allocatable([X9, X10, X11, X12]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!(out.bb_info[b(1)].local_regs_needed, [4, 0]);
  for t in temps { assert!(out.allocs[&t].local) }
  // the loop blocks sit at a different depth, so `g` is not split but spilled
  assert_eq!(out.stats.splits, 0);
  assert!(out.allocs[&g].pieces.iter().all(|p| p.1.is_none()));
  assert!(out.allocs[&g].slot.is_some());
  assert_eq!(out.stats.spilled_ranges, 1);
  // one store after the definition, one reload at the use after the loop
  assert_eq!(out.stats.stores, 1);
  assert_eq!(out.stats.reloads, 1);
}

#[test]
fn loop_pressure_without_local_allocation() {
  let (code, _, _) = busy_loop();
  let env = MachineEnv::with_allocatable([X9, X10, X11, X12]);
  let out = alloc_checked(&code, &env, &no_locals());
  assert!(out.bb_info.0.iter().all(|bi| bi.local_live.is_empty()));
}

#[test]
fn one_register_chain() {
  let mut code = VCode::default();
  let [t1, t2] = [(); 2].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(t1, 0));
  code.emit(Inst::alu(Opcode::Add, t2, t1, t1));
  code.emit(store_at(t2, 8));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let env = MachineEnv::with_allocatable([X9]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert!(out.allocs[&t1].local && out.allocs[&t2].local);
  assert_eq!(out.stats, colorra::regalloc::RaStats::default());
  assert_eq!(out.allocs[&t2].pieces[0].1, Some(X9));
}

#[test]
fn two_operands_die_into_one_result() {
  let mut code = VCode::default();
  let [t1, t2, t3] = [(); 3].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(t1, 0));
  code.emit(load_at(t2, 8));
  code.emit(Inst::alu(Opcode::Add, t3, t1, t2));
  code.emit(store_at(t3, 16));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let env = MachineEnv::with_allocatable([X9, X10]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!(out.stats.spilled_ranges, 0);
  assert_eq!((out.stats.reloads, out.stats.stores, out.stats.double_spills), (0, 0, 0));
  assert_eq!(out.bb_info[b(0)].local_regs_needed, [2, 0]);
}

#[test]
fn result_replaces_operands_beside_a_live_value() {
  let mut code = VCode::default();
  let [t1, t2, t3, t4] = [(); 4].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(t1, 0));
  code.emit(load_at(t2, 8));
  code.emit(load_at(t3, 16));
  code.emit(Inst::alu(Opcode::Add, t4, t1, t2));
  code.emit(store_at(t4, 24));
  code.emit(store_at(t3, 32));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let env = MachineEnv::with_allocatable([X9, X10, X11]);
  let with_locals = alloc_checked(&code, &env, &RaOptions::default());
  let without = alloc_checked(&code, &env, &no_locals());
  for out in [&with_locals, &without] {
    assert_eq!(out.stats.spilled_ranges, 0);
    assert_eq!((out.stats.reloads, out.stats.stores, out.stats.double_spills), (0, 0, 0));
  }
  assert_eq!(with_locals.bb_info[b(0)].local_regs_needed, [3, 0]);
}

/// `v` is loaded, survives a call, and is stored.
fn across_call() -> (VCode, VReg) {
  let mut code = VCode::default();
  let v = int(&mut code);
  code.new_block();
  code.emit(load_at(v, 8));
  code.emit(Inst::call(&[], &[], CallClobbers::Unknown));
  code.emit(store_at(v, 8));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  (code, v)
}

#[test]
fn call_crossing_takes_callee_saved() {
  let (code, v) = across_call();
  let env = MachineEnv::aapcs64();
  for opts in [RaOptions::default(), no_locals()] {
    let out = alloc_checked(&code, &env, &opts);
    assert_eq!(out.allocs[&v].pieces[0].1, Some(X19));
    assert!(out.callee_saved_used.get(X19));
    assert_eq!(out.stats.spilled_ranges, 0);
  }
}

#[test]
fn call_crossing_without_callee_saved() {
  let (code, v) = across_call();
  let env = MachineEnv::with_allocatable([X0, X1]);

  // no caller-save: the value lives in memory around the call
  let opts = RaOptions { caller_save_opt: false, ..no_locals() };
  let out = alloc_checked(&code, &env, &opts);
  assert!(out.allocs[&v].pieces[0].1.is_none());
  let pos = |f: &dyn Fn(InstOrigin) -> bool| out.pcode.origins.0.iter().position(|&o| f(o));
  let store = pos(&|o| matches!(o, InstOrigin::Spill { .. })).expect("store");
  let call = pos(&|o| o == InstOrigin::Orig(colorra::InstId::new(1))).expect("call");
  let reload = pos(&|o| matches!(o, InstOrigin::Reload { .. })).expect("reload");
  assert!(store < call && call < reload);

  // caller-save: a caller-saved register, stored at the definition and restored at the use
  let out = alloc_checked(&code, &env, &no_locals());
  let lr = &out.ranges[out.vreg_lr[&v]];
  assert_eq!(lr.assigned, Some(X0));
  assert!(lr.caller_save);
  assert_eq!((out.stats.stores, out.stats.caller_save_restores), (1, 1));
  assert_eq!(out.stats.hoisted_restores, 0);

  // as a local it cannot take a clobbered register at all
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert!(out.allocs[&v].local);
  assert!(out.allocs[&v].pieces[0].1.is_none());
}

#[test]
fn caller_save_restore_in_loop() {
  let mut code = VCode::default();
  let a = int(&mut code);
  code.new_block();
  code.emit(load_at(a, 0));
  code.finish_block();
  code.new_block();
  code.emit(Inst::call(&[], &[], CallClobbers::Unknown));
  code.emit(store_at(a, 8));
  code.emit(Inst::branch_nz(a, b(1)));
  code.finish_block();
  code.new_block();
  code.emit(store_at(a, 16));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  for (x, y) in [(0, 1), (1, 1), (1, 2)] { code.add_edge(b(x), b(y)) }
  let env = MachineEnv::with_allocatable([X0, X1]);
  for pre in [true, false] {
    let opts = RaOptions { caller_save_pre: pre, ..RaOptions::default() };
    let out = alloc_checked(&code, &env, &opts);
    assert!(out.ranges[out.vreg_lr[&a]].caller_save);
    assert_eq!(out.stats.caller_save_restores, 1);
  }
}

#[test]
fn caller_save_restore_hoisted_into_predecessor() {
  let mut code = VCode::default();
  let a = int(&mut code);
  code.new_block();
  code.emit(load_at(a, 0));
  code.emit(Inst::branch_nz(a, b(2)));
  code.finish_block();
  code.new_block();
  code.emit(Inst::call(&[], &[], CallClobbers::Unknown));
  code.emit(Inst::branch(b(3)));
  code.finish_block();
  code.new_block();
  code.emit(Inst::branch(b(3)));
  code.finish_block();
  code.new_block();
  code.emit(store_at(a, 8));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  for (x, y) in [(0, 1), (0, 2), (1, 3), (2, 3)] { code.add_edge(b(x), b(y)) }
  let env = MachineEnv::with_allocatable([X0, X1]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!((out.stats.caller_save_restores, out.stats.hoisted_restores), (1, 1));
  // the restore sits in bb1, ahead of its branch
  let bb1: Vec<_> = out.pcode.block_insts(b(1)).map(|i| out.pcode.origins[i]).collect();
  assert!(matches!(bb1[..], [InstOrigin::Orig(_), InstOrigin::Reload { .. }, InstOrigin::Orig(_)]), "{bb1:?}");
  assert!(out.pcode.block_insts(b(2)).all(|i| matches!(out.pcode.origins[i], InstOrigin::Orig(_))));
}

/// `h` is heavily used and takes the only register; `a` and `c` both overlap it but
/// not each other.
fn disjoint_spills() -> (VCode, VReg, VReg) {
  let mut code = VCode::default();
  let [h, a, c] = [(); 3].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(h, 0));
  code.emit(load_at(a, 8));
  code.emit(store_at(a, 8));
  code.emit(load_at(c, 16));
  code.emit(store_at(c, 16));
  code.emit(Inst::alu(Opcode::Add, h, h, h));
  code.emit(Inst::alu(Opcode::Add, h, h, h));
  code.emit(store_at(h, 0));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  (code, a, c)
}

#[test]
fn disjoint_spills_share_a_slot() {
  let (code, a, c) = disjoint_spills();
  let env = MachineEnv::with_allocatable([X9]);
  let out = alloc_checked(&code, &env, &no_locals());
  assert_eq!(out.stats.spilled_ranges, 2);
  let (sa, sc) = (out.allocs[&a].slot, out.allocs[&c].slot);
  assert!(sa.is_some());
  assert_eq!(sa, sc);
  // every temporary had to borrow the register of `h`
  assert_eq!(out.stats.double_spills, 4);
  assert_eq!(count_origins(&out, |o| matches!(o, InstOrigin::SaveOccupant(_))), 4);

  let opts = RaOptions { consistent_spill_reuse: false, ..no_locals() };
  let out = alloc_checked(&code, &env, &opts);
  assert_ne!(out.allocs[&a].slot, out.allocs[&c].slot);
}

#[test]
fn must_assign_under_pressure() {
  let mut code = VCode::default();
  let [g1, g2, f] = [(); 3].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(g1, 0));
  code.emit(load_at(g2, 8));
  code.emit(Inst::new(Opcode::InlineAsm, [Operand::fixed(f, OperandKind::Def, X5)]));
  code.emit(store_at(f, 16));
  code.emit(store_at(g1, 0));
  code.emit(store_at(g2, 8));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let env = MachineEnv::with_allocatable([X5, X6]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!(out.allocs[&f].bucket, LrClass::MustAssigned);
  assert_eq!(out.allocs[&f].pieces[0].1, Some(X5));
  // one of the others gets x6 and the other goes to memory
  let regs: Vec<_> = [g1, g2].iter().map(|v| out.allocs[v].pieces[0].1).collect();
  assert!(regs.contains(&Some(X6)) && regs.contains(&None), "{regs:?}");
}

#[test]
fn fixed_register_errors() {
  init_logging();
  let env = MachineEnv::aapcs64();
  let opts = RaOptions::default();

  // x5 is live across the definition that must land in x5
  let mut code = VCode::default();
  let f = int(&mut code);
  code.new_block();
  code.emit(Inst::mov_imm(X5, 1));
  code.emit(Inst::new(Opcode::InlineAsm, [Operand::fixed(f, OperandKind::Def, X5)]));
  code.emit(Inst::store(X5, AMode::reg_off(SP, 0)));
  code.emit(store_at(f, 8));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let err = regalloc_vcode(&code, &env, &opts).expect_err("conflict");
  assert!(matches!(err, RaError::MustAssignConflict { preg, .. } if preg == X5), "{err}");

  let mut code = VCode::default();
  let f = int(&mut code);
  code.new_block();
  code.emit(Inst::new(Opcode::InlineAsm, [Operand::fixed(f, OperandKind::Def, X5)]));
  code.emit(Inst::new(Opcode::InlineAsm, [Operand::fixed(f, OperandKind::Use, X6)]));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let err = regalloc_vcode(&code, &env, &opts).expect_err("conflict");
  assert!(matches!(err, RaError::ConflictingFixedRegs { .. }), "{err}");

  let mut code = VCode::default();
  code.new_block();
  code.emit(store_at(VReg::new(7, RegClass::Int), 0));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let err = regalloc_vcode(&code, &env, &opts).expect_err("unknown");
  assert!(matches!(err, RaError::UnknownVReg { .. }), "{err}");
}

#[test]
fn split_keeps_every_reference_covered() {
  let mut code = VCode::default();
  let [v, g1, g2] = [(); 3].map(|()| int(&mut code));
  code.new_block();
  code.emit(load_at(v, 24));
  code.emit(store_at(v, 32));
  code.emit(Inst::branch(b(1)));
  code.finish_block();
  code.new_block();
  code.emit(Inst::branch(b(2)));
  code.finish_block();
  code.new_block();
  code.emit(load_at(g1, 0));
  code.emit(load_at(g2, 8));
  code.emit(store_at(v, 16));
  code.emit(Inst::branch(b(3)));
  code.finish_block();
  code.new_block();
  code.emit(Inst::alu(Opcode::Add, g1, g1, g2));
  code.emit(Inst::alu(Opcode::Add, g1, g1, g2));
  code.emit(store_at(g1, 0));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  for (x, y) in [(0, 1), (1, 2), (2, 3)] { code.add_edge(b(x), b(y)) }
  let env = MachineEnv::with_allocatable([X9, X10]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!(out.stats.splits, 1);
  let pieces = &out.allocs[&v].pieces;
  assert_eq!(pieces.len(), 2);
  let covered: Vec<BlockId> = pieces.iter().flat_map(|p| p.0.iter().copied()).collect();
  assert!(covered.contains(&b(0)) && covered.contains(&b(2)));
  // fragments never share a block
  assert_eq!(covered.len(), pieces.iter().map(|p| p.0.len()).sum::<usize>());
  assert!(covered.iter().all(|bl| covered.iter().filter(|c| *c == bl).count() == 1));
}

#[test]
fn float_registers() {
  let mut code = VCode::default();
  let [f1, f2, f3, f4] = [(); 4].map(|()| float(&mut code));
  code.new_block();
  code.emit(load_at(f1, 0));
  code.emit(load_at(f2, 8));
  code.emit(Inst::alu(Opcode::Fadd, f3, f1, f2));
  code.emit(Inst::alu(Opcode::Fadd, f4, f3, f1));
  code.emit(store_at(f4, 16));
  code.emit(Inst::ret(&[]));
  code.finish_block();
  let env = MachineEnv::with_allocatable([X9, V16, V17, V18]);
  let out = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!(out.stats.spilled_ranges, 0);
  for v in [f1, f2, f3, f4] {
    let r = out.allocs[&v].pieces[0].1.expect("register");
    assert_eq!(r.class(), RegClass::Float);
  }
  // f2 dies at the first add, which gives its register to f3
  assert_eq!(out.bb_info[b(0)].local_regs_needed, [0, 2]);
}

#[test]
fn supplied_analyses_and_verbose_dumps_change_nothing() {
  let (mut code, _, _) = busy_loop();
  let env = MachineEnv::with_allocatable([X9, X10, X11, X12]);
  let plain = alloc_checked(&code, &env, &RaOptions::default());
  let verbose = alloc_checked(&code, &env, &RaOptions { verbose: true, ..RaOptions::default() });
  assert_eq!(plain.pcode.to_string(), verbose.pcode.to_string());
  code.set_liveness(Liveness::compute(&code));
  code.set_loops(LoopInfo::compute(&code));
  let supplied = alloc_checked(&code, &env, &RaOptions::default());
  assert_eq!(plain.pcode.to_string(), supplied.pcode.to_string());
  assert_eq!(plain.stats, supplied.stats);
}
