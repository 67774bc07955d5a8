//! Patch records and the applier.
//!
//! A [`PatchRecord`] is position independent: an RVA plus the bytes to write
//! there. Nothing before the final apply step touches executable memory; the
//! apply step goes through a [`CodeWriter`], which is either a plain buffer
//! (offline images, tests) or, on Windows, the live process image.

use crate::clamp::BranchRewrite;
use crate::error::{Error, Result};

use iced_x86::Encoder;
use tracing::{debug, warn};

#[cfg(target_os = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache,
    Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS},
    Threading::GetCurrentProcess,
};

/// Single-byte `nop`, used to fill the tail of a shorter replacement.
pub const NOP: u8 = 0x90;

/// Replacement bytes for one instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchRecord {
    /// Address of the replaced instruction, relative to the image base.
    pub rva: u64,
    /// Length of the replaced instruction.
    pub original_len: usize,
    /// Replacement, padded with [`NOP`] to `original_len`.
    pub bytes: Vec<u8>,
}

impl PatchRecord {
    /// Encode a branch rewrite at its original address.
    ///
    /// Fails with [`Error::PatchOverflow`] if the replacement does not fit in
    /// the original instruction.
    pub fn encode(rewrite: &BranchRewrite, image_base: u64) -> Result<Self> {
        let va = rewrite.address();
        let rva = va.wrapping_sub(image_base);
        let original_len = rewrite.original.len();

        let mut encoder = Encoder::new(64);
        encoder
            .encode(&rewrite.replacement, va)
            .map_err(|e| Error::Encode {
                rva,
                reason: e.to_string(),
            })?;
        let mut bytes = encoder.take_buffer();

        if bytes.len() > original_len {
            return Err(Error::PatchOverflow {
                rva,
                encoded: bytes.len(),
                original: original_len,
            });
        }
        bytes.resize(original_len, NOP);

        Ok(Self {
            rva,
            original_len,
            bytes,
        })
    }

    /// A record restored from persisted bytes, which are already padded.
    pub fn from_bytes(rva: u64, bytes: Vec<u8>) -> Self {
        Self {
            rva,
            original_len: bytes.len(),
            bytes,
        }
    }
}

/// Something that can overwrite code at an absolute address.
pub trait CodeWriter {
    fn write_code(&mut self, va: u64, bytes: &[u8]) -> Result<()>;
}

/// Writes into an in-memory copy of an image mapped at `base`.
pub struct BufferWriter<'a> {
    base: u64,
    buf: &'a mut [u8],
}

impl<'a> BufferWriter<'a> {
    pub fn new(base: u64, buf: &'a mut [u8]) -> Self {
        Self { base, buf }
    }
}

impl CodeWriter for BufferWriter<'_> {
    fn write_code(&mut self, va: u64, bytes: &[u8]) -> Result<()> {
        let rva = va.wrapping_sub(self.base);
        let out_of_bounds = || Error::PatchOutOfBounds {
            rva,
            len: bytes.len(),
        };

        let start = usize::try_from(va.checked_sub(self.base).ok_or_else(out_of_bounds)?)
            .map_err(|_| out_of_bounds())?;
        let end = start.checked_add(bytes.len()).ok_or_else(out_of_bounds)?;
        let dst = self.buf.get_mut(start..end).ok_or_else(out_of_bounds)?;

        dst.copy_from_slice(bytes);
        Ok(())
    }
}

/// Writes into the code of the current process.
///
/// Each write makes the target range writable, copies the bytes, restores the
/// previous protection and flushes the instruction cache for the range.
#[cfg(target_os = "windows")]
pub struct ProcessWriter {
    _private: (),
}

#[cfg(target_os = "windows")]
impl ProcessWriter {
    /// # Safety
    /// Every address later passed to [`CodeWriter::write_code`] must belong to
    /// a module image of this process, and no thread may be executing the
    /// bytes being replaced.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_os = "windows")]
impl CodeWriter for ProcessWriter {
    fn write_code(&mut self, va: u64, bytes: &[u8]) -> Result<()> {
        let addr = va as *mut u8;
        let mut old = PAGE_PROTECTION_FLAGS(0);

        unsafe {
            VirtualProtect(addr as *const _, bytes.len(), PAGE_EXECUTE_READWRITE, &mut old)
                .map_err(|_| Error::ProtectFailed(va))?;

            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());

            let mut restored = PAGE_PROTECTION_FLAGS(0);
            if VirtualProtect(addr as *const _, bytes.len(), old, &mut restored).is_err() {
                warn!("failed to restore protection at 0x{:X}", va);
            }

            let process = GetCurrentProcess();
            if FlushInstructionCache(process, Some(addr as *const _), bytes.len()).is_err() {
                warn!("failed to flush instruction cache at 0x{:X}", va);
            }
        }

        Ok(())
    }
}

/// Result of an apply pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Write each patch at `image_base + rva`.
///
/// A patch that lies outside the image or fails to write is logged and
/// skipped; the remaining patches are still attempted.
pub fn apply_patches<'p, W, I>(
    writer: &mut W,
    image_base: u64,
    image_size: usize,
    patches: I,
) -> ApplyStats
where
    W: CodeWriter + ?Sized,
    I: IntoIterator<Item = &'p PatchRecord>,
{
    let mut stats = ApplyStats::default();

    for patch in patches {
        let in_image = patch
            .rva
            .checked_add(patch.bytes.len() as u64)
            .is_some_and(|end| end <= image_size as u64);
        if !in_image {
            warn!(
                "{}",
                Error::PatchOutOfBounds {
                    rva: patch.rva,
                    len: patch.bytes.len(),
                }
            );
            stats.skipped += 1;
            continue;
        }

        match writer.write_code(image_base + patch.rva, &patch.bytes) {
            Ok(()) => {
                debug!("patched RVA 0x{:X}: {}", patch.rva, hex::encode_upper(&patch.bytes));
                stats.applied += 1;
            }
            Err(e) => {
                warn!("skipping patch at RVA 0x{:X}: {}", patch.rva, e);
                stats.skipped += 1;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clamp::tests::{BASE, CLAMP_JBE};
    use crate::clamp::ClampMatcher;
    use crate::explorer::Explorer;
    use crate::instr::InstrStream;
    use crate::memory::ImageView;

    use iced_x86::{Code, Decoder, DecoderOptions, Mnemonic};

    fn scenario_rewrites(view: &ImageView<'_>) -> Vec<BranchRewrite> {
        let index = Explorer::new(view).explore(BASE);
        ClampMatcher::new(view).find_rewrites(&index.blocks()[0])
    }

    #[test]
    fn test_encode_rel8_in_place() {
        let view = ImageView::new(BASE, &CLAMP_JBE);
        let patches: Vec<PatchRecord> = scenario_rewrites(&view)
            .iter()
            .map(|r| PatchRecord::encode(r, BASE).unwrap())
            .collect();

        assert_eq!(
            patches,
            vec![
                PatchRecord {
                    rva: 11,
                    original_len: 2,
                    bytes: vec![0xEB, 0x00],
                },
                PatchRecord {
                    rva: 16,
                    original_len: 2,
                    bytes: vec![0xEB, 0x08],
                },
            ]
        );
    }

    #[test]
    fn test_encode_rel32_pads_with_nop() {
        // ja rel32 to +0x100
        let code: &[u8] = &[0x0F, 0x87, 0x00, 0x01, 0x00, 0x00];
        let view = ImageView::new(BASE, code);
        let ja = InstrStream::at(&view, BASE).unwrap().next_instr().unwrap();

        let mut replacement = *ja.inner();
        replacement.set_code(Code::Jmp_rel32_64);
        let rewrite = BranchRewrite {
            original: ja,
            replacement,
        };

        let patch = PatchRecord::encode(&rewrite, BASE).unwrap();
        assert_eq!(patch.original_len, 6);
        assert_eq!(patch.bytes, vec![0xE9, 0x01, 0x01, 0x00, 0x00, NOP]);

        let decoded = Decoder::with_ip(64, &patch.bytes, BASE, DecoderOptions::NONE).decode();
        assert_eq!(decoded.mnemonic(), Mnemonic::Jmp);
        assert_eq!(decoded.near_branch_target(), BASE + 6 + 0x100);
    }

    #[test]
    fn test_encode_overflow_dropped() {
        let code: &[u8] = &[0x77, 0x10];
        let view = ImageView::new(BASE, code);
        let ja = InstrStream::at(&view, BASE).unwrap().next_instr().unwrap();

        let mut replacement = *ja.inner();
        replacement.set_code(Code::Jmp_rel32_64);
        let rewrite = BranchRewrite {
            original: ja,
            replacement,
        };

        assert!(matches!(
            PatchRecord::encode(&rewrite, BASE),
            Err(Error::PatchOverflow {
                rva: 0,
                encoded: 5,
                original: 2
            })
        ));
    }

    #[test]
    fn test_apply_to_buffer() {
        let mut image = CLAMP_JBE;
        let patches = {
            let view = ImageView::new(BASE, &CLAMP_JBE);
            scenario_rewrites(&view)
                .iter()
                .map(|r| PatchRecord::encode(r, BASE).unwrap())
                .collect::<Vec<_>>()
        };

        let stats = apply_patches(
            &mut BufferWriter::new(BASE, &mut image),
            BASE,
            CLAMP_JBE.len(),
            &patches,
        );
        assert_eq!(stats, ApplyStats { applied: 2, skipped: 0 });
        assert_eq!(&image[11..13], &[0xEB, 0x00]);
        assert_eq!(&image[16..18], &[0xEB, 0x08]);
        // nothing else moved
        assert_eq!(&image[..11], &CLAMP_JBE[..11]);
        assert_eq!(&image[18..], &CLAMP_JBE[18..]);
    }

    #[test]
    fn test_apply_skips_out_of_bounds() {
        let mut image = [0xCCu8; 16];
        let patches = vec![
            PatchRecord::from_bytes(15, vec![0xEB, 0x00]),
            PatchRecord::from_bytes(u64::MAX, vec![0x90]),
            PatchRecord::from_bytes(2, vec![0x90, 0x90]),
        ];

        let stats = apply_patches(
            &mut BufferWriter::new(0x1000, &mut image),
            0x1000,
            16,
            &patches,
        );
        assert_eq!(stats, ApplyStats { applied: 1, skipped: 2 });
        assert_eq!(&image[..4], &[0xCC, 0xCC, 0x90, 0x90]);
        assert_eq!(image[15], 0xCC);
    }

    #[test]
    fn test_writer_failure_is_skipped() {
        struct Refusing;
        impl CodeWriter for Refusing {
            fn write_code(&mut self, va: u64, _bytes: &[u8]) -> Result<()> {
                Err(Error::ProtectFailed(va))
            }
        }

        let patches = vec![PatchRecord::from_bytes(0, vec![0x90])];
        let stats = apply_patches(&mut Refusing, 0x1000, 16, &patches);
        assert_eq!(stats, ApplyStats { applied: 0, skipped: 1 });
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn test_process_writer_patches_live_memory() {
        let mut code = vec![0xCCu8; 0x20];
        let base = code.as_mut_ptr() as u64;

        let patches = vec![PatchRecord::from_bytes(4, vec![0xEB, 0x00])];
        let mut writer = unsafe { ProcessWriter::new() };
        let stats = apply_patches(&mut writer, base, code.len(), &patches);

        assert_eq!(stats, ApplyStats { applied: 1, skipped: 0 });
        assert_eq!(&code[3..7], &[0xCC, 0xEB, 0x00, 0xCC]);
    }
}
