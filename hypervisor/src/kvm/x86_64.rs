// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Special-register synthesis for the three starting CPU modes.
//!
//! Instead of making guest code build descriptor tables before it can run, we
//! write the hidden parts of the segment registers directly. The CPU only
//! consults the hidden descriptor after a load, so a flat segment can exist
//! without any GDT behind it — the selectors are set to the conventional
//! values purely for display. A guest that reloads a segment register will
//! fault until it installs a GDT of its own.

use kvm_bindings::kvm_dtable;
use kvm_bindings::kvm_segment;
use kvm_bindings::kvm_sregs;

use crate::CpuMode;

pub const PAGE_SIZE: u64 = 4096;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_PG: u64 = 1 << 31;
pub const CR4_PAE: u64 = 1 << 5;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

// Page-structure entry bits, identical at every level.
pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
// In a PDPT entry this selects a 1 GiB page.
pub const PTE_PAGE_SIZE: u64 = 1 << 7;

// Intel SDM Vol. 3A, 3.4.5.1: code, execute/read; data, read/write.
const SEG_TYPE_CODE_READABLE: u8 = 0b1010;
const SEG_TYPE_DATA_WRITABLE: u8 = 0b0010;
// Real-mode variants carry the accessed bit, matching the reset state.
const SEG_TYPE_CODE_ACCESSED: u8 = 0b1011;
const SEG_TYPE_DATA_ACCESSED: u8 = 0b0011;

/// A real-mode segment: base tracks `selector << 4`, limit is the fixed 64
/// KiB the hardware requires for VM entry.
fn real_mode_segment(selector: u16, code: bool) -> kvm_segment {
    kvm_segment {
        base: (selector as u64) << 4,
        limit: 0xffff,
        selector,
        type_: if code {
            SEG_TYPE_CODE_ACCESSED
        } else {
            SEG_TYPE_DATA_ACCESSED
        },
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 0,
        g: 0,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// A flat ring-0 segment covering the whole 32-bit address space
/// (page-granular limit 0xFFFFF).
fn flat_segment(selector: u16, type_: u8, db: u8, l: u8) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xfffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db,
        s: 1,
        l,
        g: 1,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// Rewrites `sregs` for a cold start in `mode`. For [`CpuMode::Long64`],
/// `pml4_base` must hold the guest physical offset of the PML4 table.
pub fn configure_sregs(sregs: &mut kvm_sregs, mode: CpuMode, pml4_base: Option<u64>) {
    // Invalid until the guest installs its own tables.
    sregs.idt = kvm_dtable::default();
    sregs.gdt = kvm_dtable::default();

    match mode {
        CpuMode::Real16 => {
            sregs.cr0 = CR0_ET;
            sregs.cr3 = 0;
            sregs.cr4 = 0;
            sregs.efer = 0;
            // KVM comes out of reset at 0xf000:0xfff0; zero everything so
            // execution starts at the bottom of memory instead.
            sregs.cs = real_mode_segment(0, true);
            let data = real_mode_segment(0, false);
            sregs.ds = data;
            sregs.es = data;
            sregs.fs = data;
            sregs.gs = data;
            sregs.ss = data;
        }
        CpuMode::Protected32 => {
            sregs.cr0 = (sregs.cr0 | CR0_PE | CR0_ET) & !CR0_PG;
            sregs.cr3 = 0;
            sregs.cr4 = 0;
            sregs.efer = 0;
            sregs.cs = flat_segment(0x8, SEG_TYPE_CODE_READABLE, 1, 0);
            let data = flat_segment(0x10, SEG_TYPE_DATA_WRITABLE, 1, 0);
            sregs.ds = data;
            sregs.es = data;
            sregs.fs = data;
            sregs.gs = data;
            sregs.ss = data;
        }
        CpuMode::Long64 => {
            // PG requires PE; PAE and LME/LMA are what make it long mode.
            sregs.cr0 = CR0_PG | CR0_PE | CR0_ET;
            sregs.cr3 = pml4_base.expect("long mode needs a PML4") & !(PAGE_SIZE - 1);
            sregs.cr4 = CR4_PAE;
            sregs.efer = EFER_LME | EFER_LMA;
            sregs.cs = flat_segment(0x8, SEG_TYPE_CODE_READABLE, 0, 1);
            let data = flat_segment(0x10, SEG_TYPE_DATA_WRITABLE, 1, 0);
            sregs.ds = data;
            sregs.es = data;
            sregs.fs = data;
            sregs.gs = data;
            sregs.ss = data;
        }
    }
}

/// Re-derives the hidden real-mode descriptor of every segment from its
/// current selector. Needed after register writes: in real mode the hidden
/// base must track `selector << 4` or the guest reads the wrong memory.
pub fn refresh_real_mode_segments(sregs: &mut kvm_sregs) {
    for seg in [
        &mut sregs.cs,
        &mut sregs.ds,
        &mut sregs.es,
        &mut sregs.fs,
        &mut sregs.gs,
        &mut sregs.ss,
    ] {
        seg.base = (seg.selector as u64) << 4;
        seg.limit = 0xffff;
    }
}
