//! Runtime unwind information for generated code.
//!
//! Framed stubs get a one-CIE, one-FDE `.eh_frame` table built with
//! `gimli::write`, handed to the platform unwinder with `__register_frame`.
//! The CIE names [`personality::stub_personality`]; the FDE's LSDA points at
//! the stub's [`personality::LandingSite`].

pub mod personality;

use gimli::write::{Address, CommonInformationEntry, EhFrame, EndianVec, FrameDescriptionEntry, FrameTable, Writer};
use gimli::{Encoding, Format, RunTimeEndian};
use log::debug;

use crate::arch::FrameDescription;
use crate::error::{DetourError, Result};

/// libgcc takes a whole zero-terminated table; libunwind takes one FDE per call.
const USING_LIBGCC: bool = cfg!(any(all(target_os = "linux", target_env = "gnu"), target_os = "freebsd"));

/// Where one framed stub lives and how it unwinds.
#[derive(Debug, Clone, Copy)]
pub struct FrameSite<'a> {
    pub start: u64,
    pub len: usize,
    pub frame: &'a FrameDescription,
    pub personality: u64,
    /// Address of the stub's `LandingSite`.
    pub lsda: u64,
}

/// Encode `site` as an `.eh_frame` section.
pub fn build_eh_frame(site: &FrameSite) -> Result<Vec<u8>> {
    let encoding = Encoding { format: Format::Dwarf32, version: 1, address_size: 8 };
    let frame = site.frame;

    let mut cie = CommonInformationEntry::new(
        encoding,
        frame.code_alignment,
        frame.data_alignment,
        frame.return_address,
    );
    for insn in &frame.initial {
        cie.add_instruction(insn.clone());
    }
    cie.personality = Some((gimli::DW_EH_PE_absptr, Address::Constant(site.personality)));
    cie.lsda_encoding = Some(gimli::DW_EH_PE_absptr);

    let len = u32::try_from(site.len).map_err(|_| DetourError::UnwindInfo(format!("stub of {} bytes", site.len)))?;
    let mut fde = FrameDescriptionEntry::new(Address::Constant(site.start), len);
    fde.lsda = Some(Address::Constant(site.lsda));
    for (offset, insn) in &frame.rows {
        fde.add_instruction(*offset, insn.clone());
    }

    let mut table = FrameTable::default();
    let cie_id = table.add_cie(cie);
    table.add_fde(cie_id, fde);

    let mut eh_frame = EhFrame(EndianVec::new(RunTimeEndian::default()));
    table.write_eh_frame(&mut eh_frame)?;
    // Zero-length terminator.
    eh_frame.0.write_u32(0)?;
    Ok(eh_frame.0.into_vec())
}

/// Byte offsets of the FDEs in an `.eh_frame` section.
pub(crate) fn fde_offsets(table: &[u8]) -> Vec<usize> {
    let word = |at: usize| -> Option<u32> {
        Some(u32::from_ne_bytes(table.get(at..at + 4)?.try_into().ok()?))
    };

    let mut out = Vec::new();
    let mut at = 0;
    while let Some(len) = word(at) {
        if len == 0 || len == u32::MAX {
            break;
        }
        match word(at + 4) {
            Some(0) => {}
            Some(_) => out.push(at),
            None => break,
        }
        at += 4 + len as usize;
    }
    out
}

#[cfg(unix)]
extern "C" {
    fn __register_frame(begin: *const u8);
    fn __deregister_frame(begin: *const u8);
}

/// A table registered with the unwinder. Deregistered on drop.
#[derive(Debug)]
pub struct UnwindRegistration {
    table: Box<[u8]>,
    entries: Vec<usize>,
}

impl UnwindRegistration {
    /// # Safety
    /// The code the table describes must stay mapped until the registration
    /// is dropped.
    pub unsafe fn register(table: Vec<u8>) -> Result<Self> {
        let table = table.into_boxed_slice();
        let entries = if USING_LIBGCC { vec![0] } else { fde_offsets(&table) };
        if entries.is_empty() {
            return Err(DetourError::UnwindInfo("table has no frame description entries".into()));
        }

        #[cfg(unix)]
        {
            for &offset in &entries {
                __register_frame(table.as_ptr().add(offset));
            }
            debug!("registered unwind info at {:p} ({} bytes)", table.as_ptr(), table.len());
            Ok(Self { table, entries })
        }

        #[cfg(not(unix))]
        {
            let _ = (table, entries);
            Err(DetourError::Unsupported)
        }
    }

    pub fn table(&self) -> &[u8] {
        &self.table
    }
}

impl Drop for UnwindRegistration {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            for &offset in &self.entries {
                __deregister_frame(self.table.as_ptr().add(offset));
            }
        }
        debug!("deregistered unwind info at {:p}", self.table.as_ptr());
    }
}
