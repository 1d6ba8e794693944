// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec between [`RegisterSet`] vector state and a raw XSAVE area.
//!
//! The legacy region (x87/SSE) of the XSAVE area has fixed offsets, but every
//! extended component lives wherever the processor says it does: CPUID leaf
//! 0xD subleaf `n` reports the offset of component `n` in ebx. KVM documents
//! that the area returned by `KVM_GET_XSAVE` uses the host layout, so the
//! offsets are discovered once from the host CPUID and reused for every
//! encode/decode.
//!
//! A ZMM register is stored scattered over up to three components (legacy
//! XMM, YMM_Hi128, ZMM_Hi256) and reassembled on decode; the sixteen high ZMM
//! registers and the opmasks are whole components of their own.

use std::arch::x86_64::__cpuid_count;

use crate::vector::Vec512;
use crate::vector::Vec64;
use crate::x86_64::HostExtensions;
use crate::x86_64::RegisterSet;

/// Size of the XSAVE area exchanged with KVM_GET_XSAVE/KVM_SET_XSAVE.
pub const XSAVE_AREA_SIZE: usize = 4096;

// Fixed offsets in the legacy region and header, Intel SDM Vol. 1, 13.4.
const MXCSR_OFFSET: usize = 24;
const MM_OFFSET: usize = 32; // Each st/mm slot is 16 bytes; mm uses the low 8.
const XMM_OFFSET: usize = 160;
/// Offset of XSTATE_BV, the component-present bitmap in the XSAVE header.
pub const XSTATE_BV_OFFSET: usize = 512;

// XCR0 / XSTATE_BV component bits.
pub const XFEATURE_X87: u64 = 1 << 0;
pub const XFEATURE_SSE: u64 = 1 << 1;
pub const XFEATURE_AVX: u64 = 1 << 2;
pub const XFEATURE_OPMASK: u64 = 1 << 5;
pub const XFEATURE_ZMM_HI256: u64 = 1 << 6;
pub const XFEATURE_HI16_ZMM: u64 = 1 << 7;

/// All three AVX-512 state components; XCR0 only accepts them as a group.
pub const XFEATURE_AVX512: u64 = XFEATURE_OPMASK | XFEATURE_ZMM_HI256 | XFEATURE_HI16_ZMM;

// CPUID leaf 0xD subleaf indices, one per component bit.
const XSTATE_CPUID_LEAF: u32 = 0xD;
const AVX_SUBLEAF: u32 = 2;
const OPMASK_SUBLEAF: u32 = 5;
const ZMM_HI256_SUBLEAF: u32 = 6;
const HI16_ZMM_SUBLEAF: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Avx512Offsets {
    opmask: usize,
    zmm_hi256: usize,
    hi16_zmm: usize,
}

/// Component offsets of the host XSAVE layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XsaveLayout {
    ymm_hi128: Option<usize>,
    avx512: Option<Avx512Offsets>,
}

impl XsaveLayout {
    /// Queries the layout of the running host.
    pub fn host() -> Self {
        let ext = HostExtensions::get();
        // SAFETY: cpuid has no side effects.
        let subleaf_offset = |n| unsafe { __cpuid_count(XSTATE_CPUID_LEAF, n) }.ebx as usize;

        let ymm_hi128 = ext.avx.then(|| subleaf_offset(AVX_SUBLEAF));
        let avx512 = ext.avx512f.then(|| Avx512Offsets {
            opmask: subleaf_offset(OPMASK_SUBLEAF),
            zmm_hi256: subleaf_offset(ZMM_HI256_SUBLEAF),
            hi16_zmm: subleaf_offset(HI16_ZMM_SUBLEAF),
        });
        let layout = XsaveLayout { ymm_hi128, avx512 };
        // KVM only exchanges the first 4 KiB; components past that cannot be
        // marshaled and are treated as absent.
        layout.clamped()
    }

    fn clamped(mut self) -> Self {
        if let Some(off) = self.ymm_hi128 {
            if off + 16 * 16 > XSAVE_AREA_SIZE {
                self.ymm_hi128 = None;
            }
        }
        if let Some(a) = self.avx512 {
            if a.opmask + 8 * 8 > XSAVE_AREA_SIZE
                || a.zmm_hi256 + 16 * 32 > XSAVE_AREA_SIZE
                || a.hi16_zmm + 16 * 64 > XSAVE_AREA_SIZE
            {
                self.avx512 = None;
            }
        }
        self
    }

    pub fn has_avx512(&self) -> bool {
        self.avx512.is_some()
    }

    /// The XSTATE_BV/XCR0 bits this layout can represent.
    pub fn supported_features(&self) -> u64 {
        let mut features = XFEATURE_X87 | XFEATURE_SSE;
        if self.ymm_hi128.is_some() {
            features |= XFEATURE_AVX;
        }
        if self.avx512.is_some() {
            features |= XFEATURE_AVX512;
        }
        features
    }

    #[cfg(test)]
    fn synthetic(ymm_hi128: Option<usize>, avx512: bool) -> Self {
        // The offsets Intel has used since Skylake-SP.
        XsaveLayout {
            ymm_hi128,
            avx512: avx512.then_some(Avx512Offsets {
                opmask: 1088,
                zmm_hi256: 1152,
                hi16_zmm: 1664,
            }),
        }
    }
}

/// Decodes the vector state of `area` into `regs`, reassembling each ZMM from
/// its scattered parts. Fields whose components the layout lacks are zeroed.
pub fn decode(area: &[u8], layout: &XsaveLayout, regs: &mut RegisterSet) {
    assert_eq!(area.len(), XSAVE_AREA_SIZE);

    regs.mxcsr = u32::from_le_bytes(area[MXCSR_OFFSET..MXCSR_OFFSET + 4].try_into().unwrap());

    for i in 0..8 {
        let off = MM_OFFSET + 16 * i;
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&area[off..off + 8]);
        regs.mmx[i] = Vec64::from_bytes(bytes);
    }

    for i in 0..16 {
        let mut bytes = [0u8; 64];
        let xmm_off = XMM_OFFSET + 16 * i;
        bytes[..16].copy_from_slice(&area[xmm_off..xmm_off + 16]);
        if let Some(base) = layout.ymm_hi128 {
            let off = base + 16 * i;
            bytes[16..32].copy_from_slice(&area[off..off + 16]);
        }
        if let Some(avx512) = layout.avx512 {
            let off = avx512.zmm_hi256 + 32 * i;
            bytes[32..64].copy_from_slice(&area[off..off + 32]);
        }
        regs.zmm[i] = Vec512::from_bytes(bytes);
    }

    match layout.avx512 {
        Some(avx512) => {
            for i in 0..16 {
                let off = avx512.hi16_zmm + 64 * i;
                regs.zmm[16 + i] = Vec512::from_bytes(area[off..off + 64].try_into().unwrap());
            }
            for i in 0..8 {
                let off = avx512.opmask + 8 * i;
                regs.k[i] = u64::from_le_bytes(area[off..off + 8].try_into().unwrap());
            }
        }
        None => {
            for zmm in &mut regs.zmm[16..] {
                *zmm = Vec512::zero();
            }
            regs.k = [0; 8];
        }
    }
}

/// Scatters the vector state of `regs` into `area`, leaving everything else
/// (x87 state, header, unrelated components) untouched. Components the layout
/// lacks are silently dropped.
pub fn encode(regs: &RegisterSet, layout: &XsaveLayout, area: &mut [u8]) {
    assert_eq!(area.len(), XSAVE_AREA_SIZE);

    area[MXCSR_OFFSET..MXCSR_OFFSET + 4].copy_from_slice(&regs.mxcsr.to_le_bytes());

    for i in 0..8 {
        let off = MM_OFFSET + 16 * i;
        area[off..off + 8].copy_from_slice(regs.mmx[i].as_bytes());
    }

    for i in 0..16 {
        let bytes = regs.zmm[i].as_bytes();
        let xmm_off = XMM_OFFSET + 16 * i;
        area[xmm_off..xmm_off + 16].copy_from_slice(&bytes[..16]);
        if let Some(base) = layout.ymm_hi128 {
            let off = base + 16 * i;
            area[off..off + 16].copy_from_slice(&bytes[16..32]);
        }
        if let Some(avx512) = layout.avx512 {
            let off = avx512.zmm_hi256 + 32 * i;
            area[off..off + 32].copy_from_slice(&bytes[32..64]);
        }
    }

    if let Some(avx512) = layout.avx512 {
        for i in 0..16 {
            let off = avx512.hi16_zmm + 64 * i;
            area[off..off + 64].copy_from_slice(regs.zmm[16 + i].as_bytes());
        }
        for i in 0..8 {
            let off = avx512.opmask + 8 * i;
            area[off..off + 8].copy_from_slice(&regs.k[i].to_le_bytes());
        }
    }
}

/// The XSAVE component bits the vector state of `regs` needs enabled in XCR0
/// for the guest to observe it.
pub fn required_features(regs: &RegisterSet) -> u64 {
    let mut features = XFEATURE_X87 | XFEATURE_SSE;

    let avx = regs.zmm[..16]
        .iter()
        .any(|zmm| zmm.as_bytes()[16..32].iter().any(|b| *b != 0));
    let avx512 = regs.k.iter().any(|k| *k != 0)
        || regs.zmm[16..].iter().any(|zmm| !zmm.is_zero())
        || regs.zmm[..16]
            .iter()
            .any(|zmm| zmm.as_bytes()[32..].iter().any(|b| *b != 0));

    if avx || avx512 {
        // The AVX-512 components architecturally require AVX in XCR0 too.
        features |= XFEATURE_AVX;
    }
    if avx512 {
        features |= XFEATURE_AVX512;
    }
    features
}
