//! Register bus abstraction.
//!
//! All control-plane code talks to the peripheral through the
//! [`RegisterBus`] trait instead of raw pointers, so the same lifecycle
//! logic runs against real memory-mapped hardware ([`MmioBus`]) and against
//! the in-memory mock in `mdf-mock`.

use crate::error::MdfResult;

/// Typed 32-bit read/modify/write access to a register window.
///
/// Offsets are byte offsets from the instance base and must be word
/// aligned. Implementations must be safe to call concurrently; callers
/// serialize read-modify-write sequences on shared registers themselves.
pub trait RegisterBus: Send + Sync {
    /// Read the register at `offset`.
    fn read(&self, offset: u32) -> MdfResult<u32>;

    /// Write `value` to the register at `offset`.
    fn write(&self, offset: u32, value: u32) -> MdfResult<()>;

    /// Read-modify-write: replace the bits selected by `mask` with the
    /// corresponding bits of `value`.
    fn update(&self, offset: u32, mask: u32, value: u32) -> MdfResult<()> {
        let current = self.read(offset)?;
        self.write(offset, (current & !mask) | (value & mask))
    }

    /// Set the bits selected by `mask`.
    fn set_bits(&self, offset: u32, mask: u32) -> MdfResult<()> {
        self.update(offset, mask, mask)
    }

    /// Clear the bits selected by `mask`.
    fn clear_bits(&self, offset: u32, mask: u32) -> MdfResult<()> {
        self.update(offset, mask, 0)
    }
}

/// Volatile access to a memory-mapped MDF instance.
pub struct MmioBus {
    base: *mut u32,
    len_words: usize,
}

impl MmioBus {
    /// Wrap a mapped MDF register window of `len_bytes` starting at
    /// `base_addr`.
    ///
    /// # Safety
    ///
    /// `base_addr` must point to a live mapping of the MDF instance, word
    /// aligned and at least `len_bytes` long, that stays valid for the
    /// lifetime of the returned bus.
    #[allow(unsafe_code)]
    pub unsafe fn from_base_addr(base_addr: *mut u32, len_bytes: usize) -> Self {
        Self {
            base: base_addr,
            len_words: len_bytes / 4,
        }
    }

    fn word_index(&self, offset: u32) -> MdfResult<usize> {
        if offset % 4 != 0 {
            return Err(crate::MdfError::InvalidParameter(format!(
                "register offset {offset:#x} is not word aligned"
            )));
        }
        let index = (offset / 4) as usize;
        if index >= self.len_words {
            return Err(crate::MdfError::InvalidParameter(format!(
                "register offset {offset:#x} outside the mapped window"
            )));
        }
        Ok(index)
    }
}

// SAFETY: the bus only ever issues volatile word accesses to a mapping the
// constructor contract guarantees is valid; interior aliasing is the
// peripheral's business, as for any MMIO window.
#[allow(unsafe_code)]
unsafe impl Send for MmioBus {}
#[allow(unsafe_code)]
unsafe impl Sync for MmioBus {}

impl RegisterBus for MmioBus {
    #[allow(unsafe_code)]
    fn read(&self, offset: u32) -> MdfResult<u32> {
        let index = self.word_index(offset)?;
        // SAFETY: index is bounds-checked against the mapped window.
        Ok(unsafe { self.base.add(index).read_volatile() })
    }

    #[allow(unsafe_code)]
    fn write(&self, offset: u32, value: u32) -> MdfResult<()> {
        let index = self.word_index(offset)?;
        // SAFETY: index is bounds-checked against the mapped window.
        unsafe { self.base.add(index).write_volatile(value) };
        Ok(())
    }
}
