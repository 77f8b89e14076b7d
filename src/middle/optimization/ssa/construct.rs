//! Promotes stack slots to SSA values. Phis are placed at the iterated
//! dominance frontier of every block that stores to a slot, then loads and
//! stores are renamed away by walking the dominator tree with one stack of
//! reaching definitions per slot.

use std::collections::{BTreeSet, VecDeque};

use hashbrown::{HashMap, HashSet};

use crate::{
    diagnostics::{Diagnostic, Diagnostics, report_diagnostic},
    error::InternalError,
    middle::{
        analysis::{cfg, dominators::DominatorTree},
        lir::{
            BlockId, Function, Immediate, Instruction, Operand, Phi, Terminator, Type, UseSite,
            ValueId,
        },
    },
};

/// A stack slot which is only ever read or written as a whole
#[derive(Debug, Clone, Copy)]
struct Candidate {
    location: ValueId,
    ty: Type,
}

enum Frame {
    Enter(BlockId),
    /// Pops the reaching definitions pushed while the block was processed
    Exit(Vec<usize>),
}

/// Rewrites `function` into SSA form and returns how many stack slots were
/// promoted. Blocks unreachable from the entry are deleted first.
pub fn construct_ssa(
    function: &mut Function,
    diagnostics: &mut Diagnostics,
) -> Result<usize, InternalError> {
    function.require_current_cfg()?;

    if !function.block(function.entry).predecessors.is_empty() {
        let body = detach_entry(function);
        cfg::build(function)?;

        tracing::debug!(
            function = %function.symbol_name,
            %body,
            "moved looping entry block into its own block"
        );
    }

    let mut tree = DominatorTree::compute(function)?;
    if !tree.unreachable().is_empty() {
        remove_blocks(function, tree.unreachable());
        cfg::build(function)?;
        tree = DominatorTree::compute(function)?;
    }

    let candidates = find_candidates(function);
    tracing::debug!(
        function = %function.symbol_name,
        candidates = candidates.len(),
        "constructing ssa"
    );

    if candidates.is_empty() {
        return Ok(0);
    }

    let slots = candidates
        .iter()
        .enumerate()
        .map(|(slot, candidate)| (candidate.location, slot))
        .collect::<HashMap<_, _>>();

    let phi_slots = insert_phis(function, &tree, &candidates, &slots);
    let substitutions = rename(function, &tree, &slots, &phi_slots, diagnostics);
    function.replace_uses(&substitutions);

    tracing::debug!(
        function = %function.symbol_name,
        promoted = candidates.len(),
        phis = phi_slots.len(),
        "constructed ssa"
    );

    Ok(candidates.len())
}

/// Moves the contents of an entry block that is also a jump target into a
/// new block, leaving the entry as a single jump to it. Phis of the moved
/// block read `null` when entered from the function start. The CFG must be
/// rebuilt afterwards.
fn detach_entry(function: &mut Function) -> BlockId {
    let entry = function.entry;
    let body = function.create_block();
    let predecessors = function.block(entry).predecessors.clone();

    let old = function.block_mut(entry);
    let phis = std::mem::take(&mut old.phis);
    let instructions = std::mem::take(&mut old.instructions);
    let terminator = std::mem::replace(
        &mut old.terminator,
        Terminator::Jump { destination: body },
    );

    let moved = function.block_mut(body);
    moved.phis = phis;
    moved.instructions = instructions;
    moved.terminator = terminator;
    moved.redirect_phi_source(entry, body);
    for phi in &mut moved.phis {
        phi.sources.insert(entry, Operand::Immediate(Immediate::Null));
    }

    for predecessor in predecessors {
        let owner = if predecessor == entry { body } else { predecessor };
        function.block_mut(owner).terminator.retarget(entry, body);
    }

    if function.exit == Some(entry) {
        function.exit = Some(body);
    }

    body
}

fn remove_blocks(function: &mut Function, blocks: &[BlockId]) {
    for block in blocks {
        let Some(removed) = function.remove_block(*block) else {
            continue;
        };

        for successor in &removed.successors {
            if let Some(successor) = function.blocks.get_mut(successor) {
                successor.remove_phi_source(*block);
            }
        }

        tracing::trace!(function = %function.symbol_name, %block, "removed unreachable block");
    }
}

/// Allocas in the entry block whose address never escapes: every use is the
/// address operand of a load or store
fn find_candidates(function: &Function) -> Vec<Candidate> {
    let users = function.users();

    function
        .block(function.entry)
        .instructions
        .iter()
        .filter_map(|instruction| match instruction {
            Instruction::Alloca { destination, ty } => Some(Candidate {
                location: *destination,
                ty: *ty,
            }),
            _ => None,
        })
        .filter(|candidate| {
            let location = Operand::Value(candidate.location);

            users
                .get(&candidate.location)
                .into_iter()
                .flatten()
                .all(|site| {
                    let UseSite::Instruction { block, index } = *site else {
                        return false;
                    };

                    match &function.block(block).instructions[index] {
                        Instruction::Load { .. } => true,
                        Instruction::Store {
                            destination,
                            source,
                        } => *destination == location && *source != location,
                        _ => false,
                    }
                })
        })
        .collect()
}

/// The slot written by a store and the value written to it
fn stored_slot(
    instruction: &Instruction,
    slots: &HashMap<ValueId, usize>,
) -> Option<(usize, Operand)> {
    match instruction {
        Instruction::Store {
            destination: Operand::Value(location),
            source,
        } => slots.get(location).map(|slot| (*slot, *source)),
        _ => None,
    }
}

/// Places an empty phi for each slot at the iterated dominance frontier of
/// its defining blocks. Returns the slot each new phi stands for.
fn insert_phis(
    function: &mut Function,
    tree: &DominatorTree,
    candidates: &[Candidate],
    slots: &HashMap<ValueId, usize>,
) -> HashMap<ValueId, usize> {
    let mut definitions: Vec<BTreeSet<BlockId>> =
        vec![BTreeSet::from([function.entry]); candidates.len()];
    for block in function.blocks.values() {
        for instruction in &block.instructions {
            if let Some((slot, _)) = stored_slot(instruction, slots) {
                definitions[slot].insert(block.id);
            }
        }
    }

    let mut phi_slots = HashMap::new();

    for (slot, candidate) in candidates.iter().enumerate() {
        let mut queued = definitions[slot].clone();
        let mut worklist = queued.iter().copied().collect::<VecDeque<_>>();
        let mut has_phi = HashSet::new();

        while let Some(block) = worklist.pop_front() {
            for frontier in tree.frontier(block) {
                if !has_phi.insert(frontier) {
                    continue;
                }

                let destination = function.create_value(candidate.ty);
                function.block_mut(frontier).phis.push(Phi {
                    destination,
                    sources: Default::default(),
                });
                phi_slots.insert(destination, slot);

                if queued.insert(frontier) {
                    worklist.push_back(frontier);
                }
            }
        }
    }

    phi_slots
}

/// Walks the dominator tree in preorder, replacing loads with the reaching
/// definition of their slot and filling in phi sources along every edge.
/// Returns the value each removed load is replaced with.
fn rename(
    function: &mut Function,
    tree: &DominatorTree,
    slots: &HashMap<ValueId, usize>,
    phi_slots: &HashMap<ValueId, usize>,
    diagnostics: &mut Diagnostics,
) -> HashMap<ValueId, Operand> {
    let symbol_name = function.symbol_name;
    let mut reaching: Vec<Vec<Operand>> = vec![Vec::new(); slots.len()];
    let mut substitutions = HashMap::new();
    let mut frames = vec![Frame::Enter(tree.entry())];

    let top = |reaching: &[Vec<Operand>], slot: usize| reaching[slot].last().copied();

    while let Some(frame) = frames.pop() {
        let block_id = match frame {
            Frame::Enter(block_id) => block_id,
            Frame::Exit(pushed) => {
                for slot in pushed {
                    reaching[slot].pop();
                }
                continue;
            }
        };

        let mut pushed = Vec::new();
        let block = function.block_mut(block_id);

        for phi in &block.phis {
            if let Some(slot) = phi_slots.get(&phi.destination) {
                reaching[*slot].push(Operand::Value(phi.destination));
                pushed.push(*slot);
            }
        }

        let instructions = std::mem::take(&mut block.instructions);
        let mut kept = Vec::with_capacity(instructions.len());

        for instruction in instructions {
            match instruction {
                Instruction::Alloca { destination, .. } if slots.contains_key(&destination) => {}
                Instruction::Load {
                    destination,
                    source: Operand::Value(location),
                } if slots.contains_key(&location) => {
                    let slot = slots[&location];
                    let value = match top(&reaching, slot) {
                        Some(value) => value,
                        None => {
                            report_diagnostic!(
                                diagnostics,
                                Diagnostic::UseBeforeInitialization {
                                    function: symbol_name,
                                    block: block_id,
                                    location,
                                }
                            );
                            Operand::Immediate(Immediate::Null)
                        }
                    };

                    substitutions.insert(destination, value);
                }
                instruction => match stored_slot(&instruction, slots) {
                    Some((slot, source)) => {
                        reaching[slot].push(source);
                        pushed.push(slot);
                    }
                    None => kept.push(instruction),
                },
            }
        }

        block.instructions = kept;

        let successors = block.successors.iter().copied().collect::<Vec<_>>();
        for successor in successors {
            for phi in &mut function.block_mut(successor).phis {
                if let Some(slot) = phi_slots.get(&phi.destination) {
                    let value =
                        top(&reaching, *slot).unwrap_or(Operand::Immediate(Immediate::Null));
                    phi.sources.insert(block_id, value);
                }
            }
        }

        frames.push(Frame::Exit(pushed));
        for child in tree.children(block_id).iter().rev() {
            frames.push(Frame::Enter(*child));
        }
    }

    substitutions
}
