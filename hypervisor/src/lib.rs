// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-vCPU KVM engine for instruction-level execution of assembly
//! snippets.
//!
//! The engine boots a guest directly into one of three CPU modes by
//! synthesizing the hidden parts of the segment registers, so user code never
//! has to build its own GDT or page tables to run. Every architectural
//! register the hardware exposes through `KVM_GET_REGS`, `KVM_GET_SREGS` and
//! the XSAVE area is marshaled in and out of a flat [`RegisterSet`].
//!
//! Nothing in this crate is thread safe; a [`kvm::KvmVm`] and everything
//! hanging off it must stay on the thread that created it.

use std::result;

use remain::sorted;
use thiserror::Error;

pub mod kvm;
pub mod vector;
pub mod x86_64;
pub mod xsave;

pub use vector::Vec128;
pub use vector::Vec256;
pub use vector::Vec512;
pub use vector::Vec64;
pub use x86_64::RegisterSet;
pub use x86_64::Table;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// The guest stopped for a reason single-stepping cannot recover from.
    #[error("guest fault: {0}")]
    GuestFault(String),
    /// Caller-side misuse of the engine.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A KVM ioctl failed.
    #[error("{op} failed: {err}")]
    Ioctl {
        op: &'static str,
        #[source]
        err: kvm_ioctls::Error,
    },
    /// Mapping host memory for the guest failed.
    #[error("failed to map guest memory: {0}")]
    Mapping(#[source] std::io::Error),
    /// KVM is missing or unusable on this host.
    #[error("KVM is not usable on this host: {0}")]
    UnsupportedHost(#[source] kvm_ioctls::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// The CPU mode a guest is initialized into.
///
/// The mode decides the initial control registers, the hidden parts of the
/// segment registers and whether an identity-mapped page structure is
/// synthesized. General purpose registers always start at zero and no stack
/// exists until code is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit real mode. All segment registers are zeroed.
    Real16,
    /// 32-bit protected mode, paging disabled. Every segment register hides a
    /// flat ring-0 descriptor spanning the whole address space; no GDT
    /// exists, so reloading a segment register faults until the guest builds
    /// its own.
    Protected32,
    /// 64-bit long mode with the whole of guest physical memory identity
    /// mapped read/write through a single 1 GiB page.
    Long64,
}

/// Execution state of the guest as observed after the last interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingState {
    /// The guest can execute at least one more instruction.
    Runnable,
    /// The guest executed a halt instruction.
    Halted,
    /// The guest shut down, e.g. through a triple fault.
    Shutdown,
    /// No code has been loaded yet.
    NoCodeLoaded,
    /// The last single step produced an exit the engine cannot interpret.
    /// Terminal until the VM is re-created.
    SingleStepError,
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperatingState::Runnable => "runnable",
            OperatingState::Halted => "halted",
            OperatingState::Shutdown => "shut down",
            OperatingState::NoCodeLoaded => "no code loaded",
            OperatingState::SingleStepError => "single step error",
        };
        f.write_str(s)
    }
}
