//! Clamp idiom matcher.
//!
//! The compiled form of `value = clamp(value, lower, upper)` this module looks
//! for is
//!
//! ```text
//!     comiss  <a>, <b>          ; first compare
//!     ja      set_lower
//!     comiss  <value>, <upper>  ; second compare
//!     jbe     finish            ; or `ja assign_upper`
//!     movaps  <value>, <upper>  ; or `movaps <target>, <value>`
//!     jmp     finish
//! set_lower:
//!     xorps   <value>, <value>
//! finish:
//! ```
//!
//! A match rewrites both conditional branches to unconditional jumps so the
//! code always takes the path that leaves the value untouched.

use crate::block::CodeBlock;
use crate::instr::Instr;
use crate::memory::ImageView;

use iced_x86::{Code, Instruction, Mnemonic};

/// Default step limit for each forward search inside one match attempt.
pub const DEFAULT_MATCH_WINDOW: usize = 10;

/// Little-endian bytes of `1.0f32`, the upper bound the pre-check looks for.
const ONE_F32: [u8; 4] = 1.0f32.to_le_bytes();

/// One conditional branch and the jump that replaces it.
#[derive(Clone, Copy, Debug)]
pub struct BranchRewrite {
    pub original: Instr,
    pub replacement: Instruction,
}

impl BranchRewrite {
    fn to_jmp(original: Instr, target: u64) -> Option<Self> {
        let code = jcc_to_jmp(original.inner().code())?;
        let mut replacement = *original.inner();
        replacement.set_code(code);
        replacement.set_near_branch64(target);
        Some(Self {
            original,
            replacement,
        })
    }

    /// Address of the rewritten branch.
    pub fn address(&self) -> u64 {
        self.original.address()
    }

    /// Where the replacement jump goes.
    pub fn target(&self) -> u64 {
        self.replacement.near_branch64()
    }
}

fn jcc_to_jmp(code: Code) -> Option<Code> {
    match code {
        Code::Ja_rel32_64 | Code::Jbe_rel32_64 => Some(Code::Jmp_rel32_64),
        Code::Ja_rel8_64 | Code::Jbe_rel8_64 => Some(Code::Jmp_rel8_64),
        _ => None,
    }
}

/// Finds clamp idioms in decoded blocks.
pub struct ClampMatcher<'a> {
    image: &'a ImageView<'a>,
    window: usize,
}

impl<'a> ClampMatcher<'a> {
    pub fn new(image: &'a ImageView<'a>) -> Self {
        Self::with_window(image, DEFAULT_MATCH_WINDOW)
    }

    pub fn with_window(image: &'a ImageView<'a>, window: usize) -> Self {
        Self { image, window }
    }

    /// Cheap rejection test: the block needs a register-register `comiss` and
    /// an instruction loading the constant `1.0` through a RIP-relative operand.
    pub fn has_candidate(&self, block: &CodeBlock) -> bool {
        let mut has_compare = false;
        let mut has_bound = false;

        for instr in block.instructions() {
            has_compare = has_compare || is_compare(instr);
            has_bound = has_bound || self.loads_one(instr);
            if has_compare && has_bound {
                return true;
            }
        }

        false
    }

    fn loads_one(&self, instr: &Instr) -> bool {
        instr
            .ip_rel_target()
            .and_then(|va| self.image.read(va, ONE_F32.len()))
            .is_some_and(|bytes| bytes == ONE_F32)
    }

    /// Every clamp occurrence in the block, two rewrites per occurrence.
    ///
    /// After a failed attempt the search restarts one instruction later; after a
    /// match it resumes right behind the matched instructions.
    pub fn find_rewrites(&self, block: &CodeBlock) -> Vec<BranchRewrite> {
        let instrs = block.instructions();
        let mut rewrites = Vec::new();
        let mut i = 0;

        while i < instrs.len() {
            match self.match_at(&instrs[i..]) {
                Some((consumed, pair)) => {
                    rewrites.extend(pair);
                    i += consumed;
                }
                None => i += 1,
            }
        }

        rewrites
    }

    fn match_at(&self, instrs: &[Instr]) -> Option<(usize, [BranchRewrite; 2])> {
        let mut cur = Cursor::new(instrs, self.window);

        let cmp0 = cur.next().filter(is_compare)?;
        let br0 = cur.next_until(is_flow_break).filter(|i| is_jcc(i, Mnemonic::Ja))?;

        let cmp1 = cur.next_check_until(Instr::is_sequential, is_compare)?;
        let value = cmp1.op_register(0);
        if value != cmp0.op_register(0) && value != cmp0.op_register(1) {
            return None;
        }

        let br1 = cur
            .next_until(is_flow_break)
            .filter(|i| is_jcc(i, Mnemonic::Ja) || is_jcc(i, Mnemonic::Jbe))?;

        let mov = cur.next_check_until(Instr::is_sequential, is_move)?;
        cur.next_until(is_flow_break).filter(is_jmp)?;

        let pair = if br1.mnemonic() == Mnemonic::Jbe {
            // jbe finish; mov value, upper
            if mov.op_register(1) != cmp1.op_register(1) {
                return None;
            }
            [
                BranchRewrite::to_jmp(br0, br0.next_address())?,
                BranchRewrite::to_jmp(br1, br1.branch_target()?)?,
            ]
        } else {
            // ja assign_upper; mov target, value
            if mov.op_register(1) != value {
                return None;
            }
            [
                BranchRewrite::to_jmp(br0, br0.next_address())?,
                BranchRewrite::to_jmp(br1, br1.next_address())?,
            ]
        };

        Some((cur.consumed(), pair))
    }
}

/// Forward cursor with bounded searches, one match attempt long.
struct Cursor<'s> {
    instrs: &'s [Instr],
    pos: usize,
    window: usize,
}

impl<'s> Cursor<'s> {
    fn new(instrs: &'s [Instr], window: usize) -> Self {
        Self {
            instrs,
            pos: 0,
            window,
        }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn next(&mut self) -> Option<Instr> {
        let instr = *self.instrs.get(self.pos)?;
        self.pos += 1;
        Some(instr)
    }

    /// Advance until `filter` holds, giving up after `window` steps.
    fn next_until(&mut self, filter: impl Fn(&Instr) -> bool) -> Option<Instr> {
        for _ in 0..self.window {
            let instr = self.next()?;
            if filter(&instr) {
                return Some(instr);
            }
        }
        None
    }

    /// Like [`Cursor::next_until`], but every visited instruction must pass `check`.
    fn next_check_until(
        &mut self,
        check: impl Fn(&Instr) -> bool,
        filter: impl Fn(&Instr) -> bool,
    ) -> Option<Instr> {
        for _ in 0..self.window {
            let instr = self.next()?;
            if !check(&instr) {
                return None;
            }
            if filter(&instr) {
                return Some(instr);
            }
        }
        None
    }
}

fn is_flow_break(instr: &Instr) -> bool {
    !instr.is_sequential()
}

fn is_compare(instr: &Instr) -> bool {
    instr.mnemonic() == Mnemonic::Comiss && instr.is_reg_reg()
}

fn is_jcc(instr: &Instr, mnemonic: Mnemonic) -> bool {
    instr.mnemonic() == mnemonic && instr.is_near_branch64()
}

fn is_jmp(instr: &Instr) -> bool {
    is_jcc(instr, Mnemonic::Jmp)
}

fn is_move(instr: &Instr) -> bool {
    matches!(
        instr.mnemonic(),
        Mnemonic::Movaps | Mnemonic::Movups | Mnemonic::Movss
    ) && instr.is_reg_reg()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::explorer::Explorer;

    use iced_x86::code_asm::*;
    use iced_x86::{Decoder, DecoderOptions};

    pub(crate) const BASE: u64 = 0x1_8000_0000;

    /// `movss xmm2, [one]` followed by the jbe form of the clamp, a `ret`, and
    /// the `1.0` constant. 40 bytes.
    pub(crate) const CLAMP_JBE: [u8; 40] = [
        0xF3, 0x0F, 0x10, 0x15, 0x14, 0x00, 0x00, 0x00, // 0: movss xmm2, [rip+0x14] -> 28
        0x0F, 0x2F, 0xCA, // 8: comiss xmm1, xmm2
        0x77, 0x0A, // 11: ja 23
        0x0F, 0x2F, 0xCB, // 13: comiss xmm1, xmm3
        0x76, 0x08, // 16: jbe 26
        0x0F, 0x28, 0xCB, // 18: movaps xmm1, xmm3
        0xEB, 0x03, // 21: jmp 26
        0x0F, 0x57, 0xC9, // 23: xorps xmm1, xmm1
        0xC3, // 26: ret
        0xCC, // 27
        0x00, 0x00, 0x80, 0x3F, // 28: 1.0f32
        0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC,
    ];

    fn single_block(view: &ImageView<'_>, entry: u64) -> CodeBlock {
        let index = Explorer::new(view).explore(entry);
        assert_eq!(index.len(), 1);
        index.blocks()[0].clone()
    }

    fn decode_one(bytes: &[u8], ip: u64) -> Instruction {
        Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE).decode()
    }

    fn encode(rewrite: &BranchRewrite) -> Vec<u8> {
        let mut encoder = iced_x86::Encoder::new(64);
        encoder
            .encode(&rewrite.replacement, rewrite.address())
            .unwrap();
        encoder.take_buffer()
    }

    #[test]
    fn test_jbe_form_rewrites() {
        let view = ImageView::new(BASE, &CLAMP_JBE);
        let block = single_block(&view, BASE);
        assert_eq!(block.end(), BASE + 27);

        let matcher = ClampMatcher::new(&view);
        assert!(matcher.has_candidate(&block));

        let rewrites = matcher.find_rewrites(&block);
        assert_eq!(rewrites.len(), 2);

        // ja becomes a jump to its own fallthrough
        assert_eq!(rewrites[0].address(), BASE + 11);
        assert_eq!(rewrites[0].target(), BASE + 13);
        assert_eq!(encode(&rewrites[0]), vec![0xEB, 0x00]);

        // jbe becomes an unconditional jump to its existing target
        assert_eq!(rewrites[1].address(), BASE + 16);
        assert_eq!(rewrites[1].target(), BASE + 26);
        assert_eq!(encode(&rewrites[1]), vec![0xEB, 0x08]);

        let patched = decode_one(&encode(&rewrites[1]), BASE + 16);
        assert_eq!(patched.mnemonic(), Mnemonic::Jmp);
        assert_eq!(patched.near_branch_target(), BASE + 26);
    }

    #[test]
    fn test_ja_form_jumps_to_fallthrough() {
        let code: [u8; 26] = [
            0x0F, 0x2F, 0xD1, // 0: comiss xmm2, xmm1
            0x77, 0x0F, // 3: ja 20 (set_lower)
            0x0F, 0x2F, 0xCB, // 5: comiss xmm1, xmm3
            0x77, 0x05, // 8: ja 15 (assign_upper)
            0x0F, 0x28, 0xC1, // 10: movaps xmm0, xmm1
            0xEB, 0x08, // 13: jmp 23
            0x0F, 0x28, 0xC3, // 15: movaps xmm0, xmm3
            0xEB, 0x03, // 18: jmp 23
            0x0F, 0x57, 0xC0, // 20: xorps xmm0, xmm0
            0xC3, // 23: ret
            0xCC, 0xCC,
        ];
        let view = ImageView::new(BASE, &code);
        let block = single_block_prefix(&view);

        let rewrites = ClampMatcher::new(&view).find_rewrites(&block);
        assert_eq!(rewrites.len(), 2);
        assert_eq!(rewrites[0].target(), BASE + 5);
        assert_eq!(rewrites[1].address(), BASE + 8);
        assert_eq!(rewrites[1].target(), BASE + 10);
    }

    /// The first block from offset 0, without exploring anything else.
    fn single_block_prefix(view: &ImageView<'_>) -> CodeBlock {
        let index = Explorer::new(view).explore(BASE);
        index.blocks()[0].clone()
    }

    #[test]
    fn test_rel32_form_keeps_length_budget() {
        let mut a = CodeAssembler::new(64).unwrap();
        let mut set_lower = a.create_label();
        let mut finish = a.create_label();
        let mut one = a.create_label();

        a.movss(xmm2, dword_ptr(one)).unwrap();
        a.comiss(xmm1, xmm2).unwrap();
        a.ja(set_lower).unwrap();
        a.comiss(xmm1, xmm3).unwrap();
        a.jbe(finish).unwrap();
        a.movaps(xmm1, xmm3).unwrap();
        a.jmp(finish).unwrap();
        // far enough away to force rel32 branches
        a.db(&[0xCC; 200]).unwrap();
        a.set_label(&mut set_lower).unwrap();
        a.xorps(xmm1, xmm1).unwrap();
        a.set_label(&mut finish).unwrap();
        a.ret().unwrap();
        a.set_label(&mut one).unwrap();
        a.dd(&[1.0f32.to_bits()]).unwrap();
        let code = a.assemble(BASE).unwrap();

        let view = ImageView::new(BASE, &code);
        let block = single_block_prefix(&view);
        let matcher = ClampMatcher::new(&view);
        assert!(matcher.has_candidate(&block));

        let rewrites = matcher.find_rewrites(&block);
        assert_eq!(rewrites.len(), 2);
        for rewrite in &rewrites {
            assert_eq!(rewrite.original.len(), 6);
            assert_eq!(rewrite.replacement.code(), Code::Jmp_rel32_64);
            assert_eq!(encode(rewrite).len(), 5);
        }
        assert_eq!(rewrites[0].target(), rewrites[0].original.next_address());
        assert_eq!(
            Some(rewrites[1].target()),
            rewrites[1].original.branch_target()
        );
    }

    #[test]
    fn test_precheck_requires_one_constant() {
        let mut code = CLAMP_JBE;
        // 2.0f32
        code[28..32].copy_from_slice(&[0x00, 0x00, 0x00, 0x40]);
        let view = ImageView::new(BASE, &code);
        let block = single_block(&view, BASE);

        let matcher = ClampMatcher::new(&view);
        assert!(!matcher.has_candidate(&block));
        // the full matcher does not look at the constant
        assert_eq!(matcher.find_rewrites(&block).len(), 2);
    }

    #[test]
    fn test_precheck_requires_register_compare() {
        let code: &[u8] = &[
            0xF3, 0x0F, 0x10, 0x15, 0x04, 0x00, 0x00, 0x00, // movss xmm2, [rip+4]
            0xC3, // ret
            0xCC, 0xCC, 0xCC, // padding
            0x00, 0x00, 0x80, 0x3F, // 1.0f32
        ];
        let view = ImageView::new(BASE, code);
        let block = single_block_prefix(&view);
        assert!(!ClampMatcher::new(&view).has_candidate(&block));
    }

    #[test]
    fn test_mismatched_value_register_rejected() {
        let mut code = CLAMP_JBE;
        // second compare uses xmm4 as value: comiss xmm4, xmm3
        code[15] = 0xE3;
        let view = ImageView::new(BASE, &code);
        let block = single_block(&view, BASE);
        assert!(ClampMatcher::new(&view).find_rewrites(&block).is_empty());
    }

    #[test]
    fn test_wrong_upper_register_rejected() {
        let mut code = CLAMP_JBE;
        // movaps xmm1, xmm4 instead of xmm1, xmm3
        code[20] = 0xCC;
        let view = ImageView::new(BASE, &code);
        let block = single_block(&view, BASE);
        assert!(ClampMatcher::new(&view).find_rewrites(&block).is_empty());
    }

    #[test]
    fn test_window_limits_search() {
        let view = ImageView::new(BASE, &CLAMP_JBE);
        let block = single_block(&view, BASE);

        assert_eq!(ClampMatcher::with_window(&view, 3).find_rewrites(&block).len(), 2);
        assert!(ClampMatcher::with_window(&view, 0)
            .find_rewrites(&block)
            .is_empty());
    }

    #[test]
    fn test_two_occurrences_in_one_block() {
        let first = &CLAMP_JBE[8..23];
        let mut code = Vec::new();
        // branch displacements are relative, so each copy keeps its own layout
        code.extend_from_slice(first);
        code.extend_from_slice(&[0x0F, 0x57, 0xC9]);
        code.extend_from_slice(first);
        code.extend_from_slice(&[0x0F, 0x57, 0xC9, 0xC3]);
        code.extend_from_slice(&[0xCC; 8]);

        let view = ImageView::new(BASE, &code);
        let index = Explorer::new(&view).explore(BASE);
        let block = index
            .blocks()
            .iter()
            .find(|b| b.start() == BASE)
            .unwrap()
            .clone();

        let rewrites = ClampMatcher::new(&view).find_rewrites(&block);
        let sites: Vec<u64> = rewrites.iter().map(|r| r.address() - BASE).collect();
        assert_eq!(sites, vec![3, 8, 21, 26]);
    }
}
