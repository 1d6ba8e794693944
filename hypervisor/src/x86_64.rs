// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The architectural register file and host feature probes.

use std::arch::x86_64::__cpuid;
use std::arch::x86_64::__cpuid_count;

use crate::vector::Vec128;
use crate::vector::Vec256;
use crate::vector::Vec512;
use crate::vector::Vec64;

/// RFLAGS bit 1 is reserved and architecturally always set.
pub const RFLAGS_RESERVED: u64 = 1 << 1;
pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;

/// State of a descriptor table register (IDTR or GDTR). `limit` is the
/// inclusive byte count minus one, exactly as the hardware register holds it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Table {
    pub base: u64,
    pub limit: u16,
}

/// The complete architectural register state of the vCPU.
///
/// This is a plain value type: every field is public and two register sets
/// compare componentwise. The widest vector alias is canonical — `zmm[i]`
/// stores the full 512 bits and [`RegisterSet::xmm`]/[`RegisterSet::ymm`] are
/// views of its low lanes. On a host without AVX-512 the upper 256 bits of
/// `zmm[0..16]`, all of `zmm[16..32]` and `k` read as zero and are ignored on
/// write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rflags: u64,
    pub rip: u64,

    // Segment selectors. The hidden descriptor state stays inside the engine;
    // see `KvmVm::set_registers` for why writes to these are ignored.
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,

    pub idt: Table,
    pub gdt: Table,

    /// MMX registers.
    pub mmx: [Vec64; 8],

    /// SSE control and status.
    pub mxcsr: u32,

    /// ZMM registers; indices 16..32 exist on AVX-512 hosts only.
    pub zmm: [Vec512; 32],

    /// AVX-512 opmask registers. Only the low 16 bits are architectural on
    /// baseline AVX-512F.
    pub k: [u64; 8],
}

impl Default for RegisterSet {
    fn default() -> Self {
        RegisterSet {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rflags: RFLAGS_RESERVED,
            rip: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            efer: 0,
            idt: Table::default(),
            gdt: Table::default(),
            mmx: Default::default(),
            mxcsr: 0x1f80, // Intel SDM Vol. 1, 11.6.4
            zmm: [Vec512::zero(); 32],
            k: [0; 8],
        }
    }
}

impl RegisterSet {
    /// The XMM view of `zmm[i]`.
    pub fn xmm(&self, i: usize) -> Vec128 {
        self.zmm[i].low128()
    }

    /// The YMM view of `zmm[i]`.
    pub fn ymm(&self, i: usize) -> Vec256 {
        self.zmm[i].low256()
    }

    /// Writes the low 128 bits of `zmm[i]`, mirroring the XMM alias into the
    /// canonical register.
    pub fn set_xmm(&mut self, i: usize, v: Vec128) {
        self.zmm[i].set_low128(v);
    }

    /// Writes the low 256 bits of `zmm[i]`.
    pub fn set_ymm(&mut self, i: usize, v: Vec256) {
        self.zmm[i].set_low256(v);
    }
}

// CPUID feature bits the engine and front-end care about.
const LEAF1_EDX_MMX_SHIFT: u32 = 23;
const LEAF1_EDX_SSE_SHIFT: u32 = 25;
const LEAF1_EDX_SSE2_SHIFT: u32 = 26;
const LEAF1_ECX_AVX_SHIFT: u32 = 28;
const LEAF7_EBX_AVX2_SHIFT: u32 = 5;
const LEAF7_EBX_AVX512F_SHIFT: u32 = 16;

/// Vector extensions the host CPU advertises. The guest sees the same CPUID
/// leaves, so this is also what guest code can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostExtensions {
    pub mmx: bool,
    pub sse: bool,
    pub sse2: bool,
    pub avx: bool,
    pub avx2: bool,
    pub avx512f: bool,
}

impl HostExtensions {
    pub fn get() -> Self {
        // SAFETY: cpuid has no side effects and is always available on
        // x86_64.
        let leaf1 = unsafe { __cpuid(1) };
        let leaf7 = unsafe { __cpuid_count(7, 0) };
        HostExtensions {
            mmx: leaf1.edx & (1 << LEAF1_EDX_MMX_SHIFT) != 0,
            sse: leaf1.edx & (1 << LEAF1_EDX_SSE_SHIFT) != 0,
            sse2: leaf1.edx & (1 << LEAF1_EDX_SSE2_SHIFT) != 0,
            avx: leaf1.ecx & (1 << LEAF1_ECX_AVX_SHIFT) != 0,
            avx2: leaf7.ebx & (1 << LEAF7_EBX_AVX2_SHIFT) != 0,
            avx512f: leaf7.ebx & (1 << LEAF7_EBX_AVX512F_SHIFT) != 0,
        }
    }
}
