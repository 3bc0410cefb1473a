//! This module contains the explorer: the driver of multi-path CFG
//! discovery.
//!
//! Exploration keeps a LIFO worklist of virtual instruction pointers, a
//! tracer snapshot per discovered block, and the invariant that a snapshot
//! captures the machine exactly at its block's entry. Straight-line
//! handlers append to the current block; branch handlers close it, lift it,
//! and enumerate successors — concretely for `Jmp`, through a slice
//! function and the solver for `Jcc`, and through the return-address
//! extraction for `Exit`.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info, warn};

use crate::{
    constant::JCC_STEP,
    error::{fault::FaultSite, Result},
    il::opt,
    lifter::Lifter,
    solver::{Options, Solver},
    tracer::{trace_vinsn, StepKind, Tracer},
    vm::{BlockId, Flow, JccDirection, Routine, VInsn},
};

/// The configuration of an exploration session.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Synthesize `External.0x<addr>` calls for exits whose program counter
    /// resolves to a constant destination.
    ///
    /// The synthesis path has seen little exposure in the wild, so it can
    /// be disabled wholesale for integration runs that need to avoid it.
    pub synthesize_external_calls: bool,

    /// The diagnostic switches forwarded to the solver.
    pub solver: Options,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            synthesize_external_calls: true,
            solver: Options::default(),
        }
    }
}

/// The explorer state for one routine discovery.
#[derive(Debug)]
pub struct Explorer {
    /// The tracer of the block currently being explored.
    tracer: Tracer,

    /// The LIFO worklist of block entry addresses left to explore.
    worklist: Vec<u64>,

    /// The addresses that have already been explored.
    explored: HashSet<u64>,

    /// The tracer snapshots, keyed by block entry address. A snapshot is
    /// never mutated once stored; exploration always works on a fork.
    snapshots: HashMap<u64, Tracer>,

    /// The block instructions are currently appended to.
    block: BlockId,

    /// Whether the current block has been closed by a terminator.
    terminate: bool,

    /// The branch-target solver.
    solver: Solver,

    /// The session configuration.
    config: Config,
}

impl Explorer {
    /// Constructs a new explorer over `tracer` with the default
    /// configuration.
    #[must_use]
    pub fn new(tracer: Tracer) -> Self {
        Self::with_config(tracer, Config::default())
    }

    /// Constructs a new explorer over `tracer` with the provided
    /// configuration.
    #[must_use]
    pub fn with_config(tracer: Tracer, config: Config) -> Self {
        Self {
            tracer,
            worklist: Vec::new(),
            explored: HashSet::new(),
            snapshots: HashMap::new(),
            block: 0,
            terminate: false,
            solver: Solver::new(config.solver),
            config,
        }
    }

    /// Discovers the routine protected behind the vmenter at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if a handler cannot be classified, a lift fails, or
    /// branch enumeration fails.
    pub fn explore(mut self, address: u64, lifter: &mut Lifter) -> Result<Routine> {
        self.tracer.seed(address);

        let mut routine = Routine::new(address);
        self.block = routine.entry();

        // The first step recognizes the vmenter and yields the context
        // pushes.
        let enter = self.tracer.step(StepKind::StopBeforeBranch)?;
        self.handle(&mut routine, lifter, enter)?;

        self.worklist.push(address);
        self.snapshots.insert(address, self.tracer.fork());

        while let Some(address) = self.worklist.pop() {
            if self.explored.contains(&address) {
                warn!("block 0x{address:x} already explored.");
                continue;
            }
            self.explored.insert(address);

            self.block = routine.block_id(address).expect("worklist entries are discovered");
            self.tracer = self
                .snapshots
                .get(&address)
                .expect("every discovered block has a snapshot")
                .fork();

            if routine.block(self.block).lifted.is_some() {
                self.reprove_block(&mut routine, lifter)?;
                continue;
            }

            debug!("exploring 0x{address:x}");

            while !self.terminate {
                let vinsn = self.tracer.step(StepKind::StopBeforeBranch)?;
                self.handle(&mut routine, lifter, vinsn)?;
            }
            self.terminate = false;

            for reprove in self.reprove_frontier(&routine) {
                info!("\treprove -> 0x{reprove:x}");
                self.worklist.push(reprove);
                self.explored.remove(&reprove);
            }
        }
        Ok(routine)
    }

    /// Dispatches one classified instruction.
    fn handle(&mut self, routine: &mut Routine, lifter: &mut Lifter, vinsn: VInsn) -> Result<()> {
        trace_vinsn(&vinsn);
        match vinsn {
            VInsn::Jmp => self.handle_jmp(routine, lifter),
            VInsn::Jcc { .. } => self.handle_jcc(routine, lifter, vinsn),
            VInsn::Exit(_) => self.handle_exit(routine, lifter, vinsn),
            VInsn::Ret => {
                routine.block_mut(self.block).add(vinsn);
                self.terminate = true;
                Ok(())
            }
            other => {
                routine.block_mut(self.block).add(other);
                Ok(())
            }
        }
    }

    /// Closes the current block on an unconditional branch: the successor
    /// falls out of concrete execution.
    fn handle_jmp(&mut self, routine: &mut Routine, lifter: &mut Lifter) -> Result<()> {
        routine.block_mut(self.block).add(VInsn::Jmp);
        self.lift_current(routine, lifter)?;

        // Execute the branch instruction.
        self.tracer.step(StepKind::ExecuteBranch)?;

        // Fork the block and continue executing from the new one.
        let vip = self.tracer.vip();
        routine.fork(self.block, vip);
        self.worklist.push(vip);
        self.snapshots.insert(vip, self.tracer.fork());

        self.terminate = true;
        Ok(())
    }

    /// Closes the current block on a conditional branch: targets are
    /// enumerated from a slice function over the discovered CFG prefix.
    fn handle_jcc(
        &mut self,
        routine: &mut Routine,
        lifter: &mut Lifter,
        vinsn: VInsn,
    ) -> Result<()> {
        let VInsn::Jcc { direction, .. } = &vinsn else {
            unreachable!("caller matched the variant")
        };
        let direction = *direction;
        routine.block_mut(self.block).add(vinsn);
        self.lift_current(routine, lifter)?;

        // Extract the targets.
        let vip = routine.block(self.block).vip();
        let slice = lifter.build_slice(routine, vip)?;
        opt::optimize_block_function(lifter.module_mut(), slice)?;
        let ret = lifter.get_return_args(slice)?;
        let targets = self
            .solver
            .possible_targets(lifter.module(), lifter.module().function(slice), ret.program_counter())
            .map_err(|e| e.at(vip))?;

        for target in targets {
            info!("\tjcc -> 0x{target:x}");
            self.schedule_jcc_target(routine, direction, target)?;
        }

        self.terminate = true;
        lifter.module_mut().erase_function(slice);
        Ok(())
    }

    /// Forks the tracer towards `target` and schedules it for exploration.
    ///
    /// The slot under the virtual stack pointer is overwritten so that the
    /// branch handler's adjustment lands exactly on `target`.
    fn schedule_jcc_target(
        &mut self,
        routine: &mut Routine,
        direction: JccDirection,
        target: u64,
    ) -> Result<()> {
        let mut fork = self.tracer.fork();
        let seeded = match direction {
            JccDirection::Up => target.wrapping_sub(JCC_STEP),
            JccDirection::Down => target.wrapping_add(JCC_STEP),
        };
        fork.write_stack_slot(seeded);
        // Execute the branch instruction.
        fork.step(StepKind::ExecuteBranch)?;

        routine.fork(self.block, target);
        self.worklist.push(target);
        self.snapshots.insert(target, fork);
        Ok(())
    }

    /// Closes the current block on a VM exit: the return-address candidate
    /// may continue devirtualization in a native tail, and a constant
    /// program counter becomes a synthesized external call.
    fn handle_exit(
        &mut self,
        routine: &mut Routine,
        lifter: &mut Lifter,
        vinsn: VInsn,
    ) -> Result<()> {
        routine.block_mut(self.block).add(vinsn);
        routine.block_mut(self.block).add(VInsn::Ret);
        self.lift_current(routine, lifter)?;

        let vip = routine.block(self.block).vip();
        let slice = lifter.build_slice(routine, vip)?;
        opt::optimize_block_function(lifter.module_mut(), slice)?;
        let args = lifter.get_return_args(slice)?;

        if self.config.synthesize_external_calls {
            let slice_fn = lifter.module().function(slice);
            if let Some(address) = constant_call_target(slice_fn, args.program_counter()) {
                let lifted = routine
                    .block(self.block)
                    .lifted
                    .expect("the current block was just lifted");
                lifter.create_external_call(lifted, address)?;
                opt::optimize_block_function(lifter.module_mut(), lifted)?;
            }
        }

        if let crate::il::Value::Const { value: address, .. } = args.return_address() {
            info!("Continue vm execution from 0x{address:x}");
            let mut continuation = Tracer::new(self.tracer.emulator().image());
            continuation.seed(address);

            routine.fork(self.block, address);
            self.worklist.push(address);
            self.snapshots.insert(address, continuation);
        }

        self.terminate = true;
        lifter.module_mut().erase_function(slice);
        Ok(())
    }

    /// Lifts and optimizes the current block, caching the function on it.
    fn lift_current(&mut self, routine: &mut Routine, lifter: &mut Lifter) -> Result<()> {
        let lifted = lifter.lift_basic_block(routine.block(self.block))?;
        opt::optimize_block_function(lifter.module_mut(), lifted)?;
        routine.block_mut(self.block).lifted = Some(lifted);
        Ok(())
    }

    /// Re-enumerates the branch targets of an already-lifted block,
    /// scheduling successors that were not reachable when the block was
    /// first proven.
    fn reprove_block(&mut self, routine: &mut Routine, lifter: &mut Lifter) -> Result<()> {
        let vip = routine.block(self.block).vip();
        let slice = lifter.build_slice(routine, vip)?;
        opt::optimize_block_function(lifter.module_mut(), slice)?;
        let ret = lifter.get_return_args(slice)?;
        let targets = self
            .solver
            .possible_targets(lifter.module(), lifter.module().function(slice), ret.program_counter())
            .map_err(|e| e.at(vip))?;
        lifter.module_mut().erase_function(slice);

        let fresh: Vec<u64> = targets
            .into_iter()
            .filter(|target| !routine.contains(*target))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        // Walk the snapshot to the branch of this block so that the stack
        // slot override lands on the branch-target slot.
        let direction = loop {
            let vinsn = self.tracer.step(StepKind::StopBeforeBranch)?;
            if let VInsn::Jcc { direction, .. } = vinsn {
                break Some(direction);
            }
            if vinsn.is_branch() {
                break None;
            }
        };
        let Some(direction) = direction else {
            return Ok(());
        };

        for target in fresh {
            info!("\tfound new branch: 0x{target:x}");
            self.schedule_jcc_target(routine, direction, target)?;
        }
        Ok(())
    }

    /// Computes the conditional descendants of the current block that still
    /// have fewer than two successors and should be proven again.
    fn reprove_frontier(&self, routine: &Routine) -> BTreeSet<u64> {
        let mut frontier = BTreeSet::new();
        let mut stack = vec![self.block];
        let mut visited: HashSet<BlockId> = HashSet::new();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            for child_id in &routine.block(id).next {
                let child = routine.block(*child_id);
                if !frontier.contains(&child.vip())
                    && child.next.len() != 2
                    && child.flow() == Flow::Conditional
                {
                    frontier.insert(child.vip());
                    stack.push(*child_id);
                }
            }
        }
        frontier
    }
}

/// Checks whether the program-counter candidate resolves to a constant call
/// target: either a constant immediate (a direct destination) or a load
/// from a constant location (an import thunk).
fn constant_call_target(function: &crate::il::Function, pc: crate::il::Value) -> Option<u64> {
    use crate::il::{Inst, Value};

    if let Value::Const { value, .. } = pc {
        return Some(value);
    }
    let Value::Inst(id) = pc else {
        return None;
    };
    let Inst::Load { ptr, .. } = &function.insts[id] else {
        return None;
    };
    let Value::Inst(gep_id) = ptr else {
        return None;
    };
    let Inst::Gep { offset, .. } = &function.insts[*gep_id] else {
        return None;
    };
    offset.as_const()
}
