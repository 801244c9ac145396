// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

//! Executable slabs hosting translated sequences.
//!
//! An [`ExecBlock`] is one fixed-capacity mapping of host-executable memory.
//! Translated code is appended as *sequences*, contiguous runs of translated
//! guest instructions entered through a single sequence id. Splitting
//! manufactures a new entry point into already-written code without
//! re-emitting anything.

use std::os::fd::OwnedFd;

use nix::{
    errno::Errno,
    sys::{memfd, mman::ProtFlags},
};

use crate::{
    memory::Address,
    patch::Patch,
    tracing::{self, TraceItem},
};

/// Host bytes of one executable slab.
pub const EXEC_BLOCK_SIZE: usize = 4096;

/// Host bytes reserved at the top of each slab for the dispatcher epilogue.
const EPILOGUE_SIZE: usize = 64;

bitflags::bitflags! {
    /// Position of a sequence within its basic block.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SeqType: u8 {
        /// The sequence starts a basic block.
        const ENTRY = 0b01;
        /// The sequence ends a basic block.
        const EXIT = 0b10;
    }
}

/// Outcome of a successful sequence write.
#[derive(Copy, Clone, Debug)]
pub struct SeqWriteResult {
    pub seq_id: u16,
    /// Patches actually written; the tail that did not fit stays with the
    /// caller.
    pub patch_written: u16,
    /// Host bytes emitted.
    pub bytes_written: u32,
}

struct InstInfo {
    address: Address,
    #[allow(dead_code)]
    offset: u32,
}

struct SeqInfo {
    start_inst: u16,
    end_inst: u16,
    seq_type: SeqType,
}

/// One slab of executable memory hosting translated sequences.
pub struct ExecBlock {
    #[allow(dead_code)]
    fd: OwnedFd,
    map: memmap2::MmapMut,
    /// Host write offset of the next sequence.
    cursor: usize,
    inst_registry: Vec<InstInfo>,
    seq_registry: Vec<SeqInfo>,
    selected: Option<u16>,
}

impl std::fmt::Debug for ExecBlock {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("ExecBlock")
            .field("cursor", &self.cursor)
            .field("instructions", &self.inst_registry.len())
            .field("sequences", &self.seq_registry.len())
            .finish_non_exhaustive()
    }
}

impl ExecBlock {
    /// Returns a slab backed by an `mmap(2)` created area of
    /// [`EXEC_BLOCK_SIZE`] bytes with read, write and execute permissions.
    pub fn new() -> Result<Self, Errno> {
        let name = c"exec-block";
        let fd = memfd::memfd_create(name, memfd::MFdFlags::MFD_CLOEXEC)?;
        nix::unistd::ftruncate(&fd, EXEC_BLOCK_SIZE as i64)?;
        // SAFETY: `fd` is a valid file descriptor.
        let mut map = unsafe {
            memmap2::MmapOptions::new()
                .len(EXEC_BLOCK_SIZE)
                .map_mut(&fd)
                .map_err(|_| Errno::ENOMEM)?
        };
        // SAFETY: `map`'s pointer is a valid memory address pointer of size
        // `EXEC_BLOCK_SIZE`.
        unsafe {
            nix::sys::mman::mprotect(
                std::ptr::NonNull::new(map.as_mut_ptr().cast::<core::ffi::c_void>())
                    .ok_or(Errno::EINVAL)?,
                EXEC_BLOCK_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )?;
        }
        #[cfg(target_os = "linux")]
        {
            // Don't include translated code in dumped core files.
            _ = map.advise(memmap2::Advice::DontDump);
        }
        Ok(Self {
            fd,
            map,
            cursor: 0,
            inst_registry: Vec::new(),
            seq_registry: Vec::new(),
            selected: None,
        })
    }

    const fn epilogue_start() -> usize {
        EXEC_BLOCK_SIZE - EPILOGUE_SIZE
    }

    /// Host bytes still writable before the epilogue.
    #[inline]
    pub fn epilogue_offset(&self) -> usize {
        Self::epilogue_start() - self.cursor
    }

    /// Fraction of the writable slab already holding translated code.
    #[inline]
    pub fn occupation_ratio(&self) -> f32 {
        self.cursor as f32 / Self::epilogue_start() as f32
    }

    /// Writes `patches` as a new sequence of type `seq_type`.
    ///
    /// As many leading patches as fit are emitted; the result reports how
    /// many. Returns `None` when not even the first patch fits (the caller
    /// retries on another slab; a fresh slab always accepts at least one
    /// patch of sane size).
    pub fn write_sequence(&mut self, patches: &[Patch], seq_type: SeqType) -> Option<SeqWriteResult> {
        debug_assert!(!patches.is_empty());
        let start_inst = self.inst_registry.len();
        if start_inst >= usize::from(u16::MAX) || self.seq_registry.len() >= usize::from(u16::MAX) {
            return None;
        }
        let start_cursor = self.cursor;
        let mut cursor = start_cursor;
        let mut written = 0_usize;
        for patch in patches {
            let code = &patch.code;
            if cursor + code.len() > Self::epilogue_start()
                || start_inst + written >= usize::from(u16::MAX)
            {
                break;
            }
            self.map[cursor..cursor + code.len()].copy_from_slice(code);
            self.inst_registry.push(InstInfo {
                address: patch.metadata.address,
                offset: cursor as u32,
            });
            cursor += code.len();
            written += 1;
        }
        if written == 0 {
            tracing::event!(
                target: TraceItem::ExecBlock.as_str(),
                tracing::Level::TRACE,
                "Slab full, refusing sequence at {}",
                patches[0].metadata.address,
            );
            return None;
        }
        self.cursor = cursor;
        let seq_id = self.seq_registry.len() as u16;
        self.seq_registry.push(SeqInfo {
            start_inst: start_inst as u16,
            end_inst: (start_inst + written - 1) as u16,
            seq_type,
        });
        tracing::event!(
            target: TraceItem::ExecBlock.as_str(),
            tracing::Level::TRACE,
            "Wrote {} of {} patches as seqID {} ({} host bytes)",
            written,
            patches.len(),
            seq_id,
            cursor - start_cursor,
        );
        Some(SeqWriteResult {
            seq_id,
            patch_written: written as u16,
            bytes_written: (cursor - start_cursor) as u32,
        })
    }

    /// Manufactures a new sequence entering the translated code at
    /// `inst_id`, reusing the emitted instructions of the owning sequence.
    pub fn split_sequence(&mut self, inst_id: u16) -> u16 {
        let parent = self.seq_id_of(inst_id);
        let parent_info = &self.seq_registry[usize::from(parent)];
        let info = SeqInfo {
            start_inst: inst_id,
            end_inst: parent_info.end_inst,
            seq_type: parent_info.seq_type | SeqType::ENTRY,
        };
        let seq_id = self.seq_registry.len() as u16;
        self.seq_registry.push(info);
        tracing::event!(
            target: TraceItem::ExecBlock.as_str(),
            tracing::Level::TRACE,
            "Split seqID {} at instID {} as new seqID {}",
            parent,
            inst_id,
            seq_id,
        );
        seq_id
    }

    /// Arms the dispatcher selector on `seq_id`.
    pub fn select_seq(&mut self, seq_id: u16) {
        debug_assert!(usize::from(seq_id) < self.seq_registry.len());
        self.selected = Some(seq_id);
    }

    /// Currently selected sequence, if any.
    pub fn selected_seq(&self) -> Option<u16> {
        self.selected
    }

    /// Id of the oldest sequence containing `inst_id`.
    pub fn seq_id_of(&self, inst_id: u16) -> u16 {
        // Every registered instruction belongs to the sequence created by
        // the write that registered it, so a match always exists.
        self.seq_registry
            .iter()
            .position(|seq| seq.start_inst <= inst_id && inst_id <= seq.end_inst)
            .map(|idx| idx as u16)
            .unwrap()
    }

    /// First instruction id of sequence `seq_id`.
    #[inline]
    pub fn seq_start(&self, seq_id: u16) -> u16 {
        self.seq_registry[usize::from(seq_id)].start_inst
    }

    /// Last instruction id of sequence `seq_id`.
    #[inline]
    pub fn seq_end(&self, seq_id: u16) -> u16 {
        self.seq_registry[usize::from(seq_id)].end_inst
    }

    /// Basic block position flags of sequence `seq_id`.
    #[inline]
    pub fn seq_type(&self, seq_id: u16) -> SeqType {
        self.seq_registry[usize::from(seq_id)].seq_type
    }

    /// Guest address of instruction `inst_id`.
    #[inline]
    pub fn inst_address(&self, inst_id: u16) -> Address {
        self.inst_registry[usize::from(inst_id)].address
    }

    /// Number of translated instructions hosted by the slab.
    #[inline]
    pub fn inst_count(&self) -> usize {
        self.inst_registry.len()
    }

    /// Number of sequences hosted by the slab, splits included.
    #[inline]
    pub fn seq_count(&self) -> usize {
        self.seq_registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::Address, patch::InstMetadata};

    const NOP: u32 = 0xd503_201f;

    fn nop_patch(address: u64, host_bytes: usize) -> Patch {
        assert_eq!(host_bytes % 4, 0);
        let encoding = NOP.to_le_bytes();
        let metadata = InstMetadata::decode(encoding, Address(address)).unwrap();
        Patch::new(metadata, encoding.repeat(host_bytes / 4))
    }

    #[test]
    fn write_and_registries() {
        let mut block = ExecBlock::new().unwrap();
        let patches = [nop_patch(0x1000, 8), nop_patch(0x1004, 8)];
        let before = block.epilogue_offset();
        let res = block
            .write_sequence(&patches, SeqType::ENTRY | SeqType::EXIT)
            .unwrap();
        assert_eq!(res.seq_id, 0);
        assert_eq!(res.patch_written, 2);
        assert_eq!(res.bytes_written, 16);
        assert_eq!(block.epilogue_offset(), before - 16);
        assert_eq!(block.seq_start(0), 0);
        assert_eq!(block.seq_end(0), 1);
        assert_eq!(block.inst_address(0), Address(0x1000));
        assert_eq!(block.inst_address(1), Address(0x1004));
        assert_eq!(block.seq_type(0), SeqType::ENTRY | SeqType::EXIT);
        assert!(block.occupation_ratio() > 0.0);
    }

    #[test]
    fn partial_write_reports_truncation() {
        let mut block = ExecBlock::new().unwrap();
        // Each patch takes 1008 host bytes; the writable area fits four.
        let patches: Vec<Patch> = (0..5)
            .map(|i| nop_patch(0x2000 + 4 * i, 1008))
            .collect();
        let res = block.write_sequence(&patches, SeqType::ENTRY).unwrap();
        assert_eq!(res.patch_written, 4);
        let res = block.write_sequence(&patches[4..], SeqType::EXIT);
        assert!(res.is_none());
    }

    #[test]
    fn split_shares_tail() {
        let mut block = ExecBlock::new().unwrap();
        let patches = [
            nop_patch(0x1000, 8),
            nop_patch(0x1004, 8),
            nop_patch(0x1008, 8),
        ];
        block
            .write_sequence(&patches, SeqType::ENTRY | SeqType::EXIT)
            .unwrap();
        let seq_id = block.split_sequence(1);
        assert_eq!(seq_id, 1);
        assert_eq!(block.seq_start(1), 1);
        assert_eq!(block.seq_end(1), 2);
        assert!(block.seq_type(1).contains(SeqType::ENTRY));
        assert_eq!(block.seq_id_of(1), 0);
        assert_eq!(block.inst_count(), 3);
        assert_eq!(block.seq_count(), 2);
    }

    #[test]
    fn selector() {
        let mut block = ExecBlock::new().unwrap();
        block
            .write_sequence(&[nop_patch(0x1000, 8)], SeqType::ENTRY | SeqType::EXIT)
            .unwrap();
        assert_eq!(block.selected_seq(), None);
        block.select_seq(0);
        assert_eq!(block.selected_seq(), Some(0));
    }
}
