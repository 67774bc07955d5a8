//! Code blocks and the per-root block index.
//!
//! A [`CodeBlock`] is a gapless run of instructions. A [`BlockIndex`] keeps the
//! blocks discovered from one exploration root sorted by address and free of
//! overlaps; inserting a block that touches a neighbour merges the two.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::instr::Instr;

/// Ordered, non-empty, gapless run of instructions.
#[derive(Clone, Debug)]
pub struct CodeBlock {
    instrs: Vec<Instr>,
}

impl CodeBlock {
    /// Build a block. The instructions must be non-empty and contiguous.
    pub fn new(instrs: Vec<Instr>) -> Result<Self> {
        if instrs.is_empty() {
            return Err(Error::EmptyBlock);
        }
        for pair in instrs.windows(2) {
            if pair[0].next_address() != pair[1].address() {
                return Err(Error::DiscontiguousBlocks {
                    end: pair[0].next_address(),
                    start: pair[1].address(),
                });
            }
        }
        Ok(Self { instrs })
    }

    /// Address of the first instruction.
    #[inline]
    pub fn start(&self) -> u64 {
        self.instrs[0].address()
    }

    /// Address immediately following the last instruction.
    #[inline]
    pub fn end(&self) -> u64 {
        self.instrs[self.instrs.len() - 1].next_address()
    }

    #[inline]
    pub fn contains(&self, va: u64) -> bool {
        va >= self.start() && va < self.end()
    }

    #[inline]
    pub fn instructions(&self) -> &[Instr] {
        &self.instrs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Append `other`, which must start exactly where this block ends.
    pub fn merge(&mut self, other: CodeBlock) -> Result<()> {
        if self.end() != other.start() {
            return Err(Error::DiscontiguousBlocks {
                end: self.end(),
                start: other.start(),
            });
        }
        self.instrs.extend(other.instrs);
        Ok(())
    }
}

/// Address-ordered, overlap-free set of blocks for one exploration root,
/// plus the direct call targets seen while building it.
#[derive(Clone, Debug, Default)]
pub struct BlockIndex {
    blocks: Vec<CodeBlock>,
    call_targets: Vec<u64>,
    seen_calls: HashSet<u64>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block, merging it with an adjacent predecessor and/or successor.
    ///
    /// Fails with [`Error::BlockOverlap`] if any byte of `block` already belongs
    /// to an indexed block; the index is left unchanged in that case.
    pub fn insert(&mut self, block: CodeBlock) -> Result<()> {
        let start = block.start();
        let end = block.end();

        // first block that does not end at or before `start`
        let idx = self.blocks.partition_point(|b| b.end() <= start);
        if let Some(next) = self.blocks.get(idx) {
            if next.start() < end {
                return Err(Error::BlockOverlap { start, end });
            }
        }

        let merge_before = idx > 0 && self.blocks[idx - 1].end() == start;
        let merge_after = self.blocks.get(idx).is_some_and(|next| next.start() == end);

        match (merge_before, merge_after) {
            (false, false) => self.blocks.insert(idx, block),
            (true, false) => self.blocks[idx - 1].merge(block)?,
            (false, true) => {
                let mut merged = block;
                merged.merge(self.blocks.remove(idx))?;
                self.blocks.insert(idx, merged);
            }
            (true, true) => {
                let next = self.blocks.remove(idx);
                let prev = &mut self.blocks[idx - 1];
                prev.merge(block)?;
                prev.merge(next)?;
            }
        }

        Ok(())
    }

    /// True if `va` lies inside an indexed block.
    pub fn contains(&self, va: u64) -> bool {
        let idx = self.blocks.partition_point(|b| b.start() <= va);
        idx > 0 && va < self.blocks[idx - 1].end()
    }

    /// Start of the first indexed block at or after `va`.
    pub fn next_block_start(&self, va: u64) -> Option<u64> {
        let idx = self.blocks.partition_point(|b| b.start() < va);
        self.blocks.get(idx).map(CodeBlock::start)
    }

    /// Record a direct call target. Duplicates are ignored; discovery order is kept.
    pub fn add_call_target(&mut self, target: u64) {
        if self.seen_calls.insert(target) {
            self.call_targets.push(target);
        }
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    /// Direct call targets in discovery order.
    pub fn call_targets(&self) -> &[u64] {
        &self.call_targets
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
