//! Control-flow recovery from one entry point.
//!
//! Starting at an entry address, blocks are decoded until a return, interrupt,
//! unconditional branch, decode failure, or the start of an already indexed
//! block. Literal branch targets are queued and walked breadth-first within the
//! same root; literal call targets inside the image are only recorded, and the
//! scan orchestrator decides whether to walk them as roots of their own.

use std::collections::VecDeque;

use crate::block::{BlockIndex, CodeBlock};
use crate::instr::{Flow, Instr, InstrStream};
use crate::memory::ImageView;

use iced_x86::Mnemonic;
use tracing::trace;

/// Walks control flow over an image window.
pub struct Explorer<'a> {
    image: &'a ImageView<'a>,
}

impl<'a> Explorer<'a> {
    pub fn new(image: &'a ImageView<'a>) -> Self {
        Self { image }
    }

    /// Recover the blocks reachable from `entry` without following calls.
    pub fn explore(&self, entry: u64) -> BlockIndex {
        let mut index = BlockIndex::new();
        let mut queue = VecDeque::from([entry]);

        while let Some(va) = queue.pop_front() {
            if index.contains(va) {
                continue;
            }

            let limit = index.next_block_start(va);
            let Some(walk) = self.decode_block(va, limit) else {
                continue;
            };

            let start = walk.block.start();
            let end = walk.block.end();
            match index.insert(walk.block) {
                Ok(()) => {
                    queue.extend(walk.branch_targets);
                    for target in walk.call_targets {
                        index.add_call_target(target);
                    }
                }
                Err(_) => {
                    // the colliding bytes already belong to a block whose edges were queued
                    trace!("discarding colliding block 0x{:X}..0x{:X}", start, end);
                }
            }
        }

        index
    }

    /// Decode one block starting at `va`, stopping before `limit` if given.
    fn decode_block(&self, va: u64, limit: Option<u64>) -> Option<BlockWalk> {
        let mut stream = match InstrStream::at(self.image, va) {
            Ok(stream) => stream,
            Err(err) => {
                trace!("{}", err);
                return None;
            }
        };

        let mut instrs: Vec<Instr> = Vec::new();
        let mut branch_targets = Vec::new();
        let mut call_targets = Vec::new();
        let mut decode_failed = false;

        loop {
            let instr = match stream.next_instr() {
                Ok(instr) => instr,
                Err(err) => {
                    trace!("block at 0x{:X} stopped: {}", va, err);
                    decode_failed = true;
                    break;
                }
            };
            instrs.push(instr);

            match instr.flow() {
                Flow::Return | Flow::Interrupt => break,
                Flow::Call => {
                    if let Some(target) = instr.branch_target() {
                        if self.image.contains(target) {
                            call_targets.push(target);
                        }
                    }
                }
                Flow::ConditionalBranch => {
                    if let Some(target) = instr.branch_target() {
                        branch_targets.push(target);
                    }
                }
                Flow::UnconditionalBranch => {
                    if let Some(target) = instr.branch_target() {
                        branch_targets.push(target);
                    }
                    break;
                }
                Flow::Sequential => {}
            }

            if limit.is_some_and(|limit| instr.next_address() >= limit) {
                break;
            }
        }

        let ended_at_limit = instrs
            .last()
            .is_some_and(|last| limit.is_some_and(|limit| last.next_address() >= limit));

        // alignment filler directly after the block
        if !ended_at_limit && !decode_failed {
            while let Ok(instr) = stream.next_instr() {
                if instr.mnemonic() != Mnemonic::Nop {
                    break;
                }
                if limit.is_some_and(|limit| instr.address() >= limit) {
                    break;
                }
                instrs.push(instr);
                if limit.is_some_and(|limit| instr.next_address() >= limit) {
                    break;
                }
            }
        }

        let block = CodeBlock::new(instrs).ok()?;
        Some(BlockWalk {
            block,
            branch_targets,
            call_targets,
        })
    }
}

/// One decoded block and the edges it found.
struct BlockWalk {
    block: CodeBlock,
    branch_targets: Vec<u64>,
    call_targets: Vec<u64>,
}
