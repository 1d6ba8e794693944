// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The KVM-backed single-step execution engine.

pub mod x86_64;

use std::ptr::null_mut;

use kvm_bindings::kvm_guest_debug;
use kvm_bindings::kvm_msr_filter;
use kvm_bindings::kvm_regs;
use kvm_bindings::kvm_userspace_memory_region;
use kvm_bindings::KVMIO;
use kvm_bindings::KVM_GUESTDBG_ENABLE;
use kvm_bindings::KVM_GUESTDBG_SINGLESTEP;
use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use kvm_ioctls::VcpuExit;
use kvm_ioctls::VcpuFd;
use kvm_ioctls::VmFd;
use log::debug;
use log::warn;
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::ioctl_ioc_nr;
use vmm_sys_util::ioctl_iow_nr;
use zerocopy::IntoBytes;

use crate::x86_64::RegisterSet;
use crate::x86_64::Table;
use crate::x86_64::RFLAGS_RESERVED;
use crate::xsave;
use crate::xsave::XsaveLayout;
use crate::CpuMode;
use crate::Error;
use crate::OperatingState;
use crate::Result;

pub use self::x86_64::PAGE_SIZE;
use self::x86_64::PTE_PAGE_SIZE;
use self::x86_64::PTE_PRESENT;
use self::x86_64::PTE_WRITABLE;

// Not wrapped by kvm-ioctls; the struct is read-only for the kernel.
ioctl_iow_nr!(KVM_X86_SET_MSR_FILTER, KVMIO, 0xc6, kvm_msr_filter);

/// Anonymous host memory backing a guest physical region.
struct GuestRam {
    addr: *mut u8,
    size: usize,
}

impl GuestRam {
    fn new(size: usize) -> Result<GuestRam> {
        // SAFETY: anonymous private mapping with no backing fd; the result is
        // checked before use.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mapping(std::io::Error::last_os_error()));
        }
        Ok(GuestRam {
            addr: addr as *mut u8,
            size,
        })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping stays valid and this thread is the only
        // host-side accessor; the vCPU never runs concurrently with it.
        unsafe { std::slice::from_raw_parts(self.addr, self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same as as_slice, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.size) }
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        // SAFETY: addr/size describe exactly the mapping created in new().
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// A single-vCPU KVM guest that executes one instruction per [`KvmVm::step`].
///
/// The guest sees the host's own CPUID, so whatever ISA extensions the host
/// advertises are available to guest code. Guest physical memory starts at 0
/// and is `memory_size` bytes long; in long mode two extra page frames are
/// placed just past it to hold the identity-map page structure, invisible to
/// [`KvmVm::dump_physical`].
pub struct KvmVm {
    // Field order is drop order: unmap guest memory, then close the vCPU,
    // the VM and the KVM handle.
    ram: GuestRam,
    page_tables: Option<GuestRam>,
    vcpu: VcpuFd,
    vm: VmFd,
    _kvm: Kvm,
    mode: CpuMode,
    state: OperatingState,
    layout: XsaveLayout,
    memory_size: u64,
}

impl KvmVm {
    /// Creates a guest with `memory_pages` pages of physical memory, set up
    /// to start in `mode`.
    pub fn new(mode: CpuMode, memory_pages: u64) -> Result<KvmVm> {
        if memory_pages == 0 {
            return Err(Error::InvalidArgument("memory size must be nonzero"));
        }
        let memory_size = memory_pages * PAGE_SIZE;

        let kvm = Kvm::new().map_err(Error::UnsupportedHost)?;
        let vm = kvm.create_vm().map_err(|err| Error::Ioctl {
            op: "KVM_CREATE_VM",
            err,
        })?;
        let vcpu = vm.create_vcpu(0).map_err(|err| Error::Ioctl {
            op: "KVM_CREATE_VCPU",
            err,
        })?;

        // An all-deny-nothing filter: with zero ranges the guest accesses its
        // MSRs without host interposition. KVM's default with no filter
        // installed is murkier, so install the explicit one.
        let filter = kvm_msr_filter::default();
        // SAFETY: the ioctl reads `filter` only for the duration of the call.
        let ret = unsafe { ioctl_with_ref(&vm, KVM_X86_SET_MSR_FILTER(), &filter) };
        if ret != 0 {
            return Err(Error::Ioctl {
                op: "KVM_X86_SET_MSR_FILTER",
                err: kvm_ioctls::Error::last(),
            });
        }

        // Mirror the host CPUID wholesale; hiding extensions from a lab guest
        // helps nobody.
        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|err| Error::Ioctl {
                op: "KVM_GET_SUPPORTED_CPUID",
                err,
            })?;
        vcpu.set_cpuid2(&cpuid).map_err(|err| Error::Ioctl {
            op: "KVM_SET_CPUID2",
            err,
        })?;

        let ram = GuestRam::new(memory_size as usize)?;
        Self::register_region(&vm, 0, 0, &ram)?;

        let mut vm = KvmVm {
            ram,
            page_tables: None,
            vcpu,
            vm,
            _kvm: kvm,
            mode,
            state: OperatingState::NoCodeLoaded,
            layout: XsaveLayout::host(),
            memory_size,
        };
        vm.set_mode(mode)?;
        Ok(vm)
    }

    fn register_region(vm: &VmFd, slot: u32, guest_phys_addr: u64, ram: &GuestRam) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr,
            memory_size: ram.size as u64,
            userspace_addr: ram.addr as u64,
        };
        // SAFETY: the region points at a live mapping owned by `ram`, which
        // outlives the VM fd (drop order in KvmVm).
        unsafe { vm.set_user_memory_region(region) }.map_err(|err| Error::Ioctl {
            op: "KVM_SET_USER_MEMORY_REGION",
            err,
        })
    }

    /// Puts the vCPU into the initial state for `mode`: zeroed GPRs,
    /// rflags = 0x2, mode-appropriate control registers and hidden segment
    /// descriptors, and (for long mode) a freshly built identity map.
    fn set_mode(&mut self, mode: CpuMode) -> Result<()> {
        let pml4_base = match mode {
            CpuMode::Long64 => Some(self.build_identity_map()?),
            _ => None,
        };

        let mut sregs = self.vcpu.get_sregs().map_err(|err| Error::Ioctl {
            op: "KVM_GET_SREGS",
            err,
        })?;
        x86_64::configure_sregs(&mut sregs, mode, pml4_base);
        self.vcpu.set_sregs(&sregs).map_err(|err| Error::Ioctl {
            op: "KVM_SET_SREGS",
            err,
        })?;

        let regs = kvm_regs {
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        self.vcpu.set_regs(&regs).map_err(|err| Error::Ioctl {
            op: "KVM_SET_REGS",
            err,
        })?;
        self.mode = mode;
        Ok(())
    }

    /// Allocates PML4 + PDPT frames just past the user-visible memory and
    /// identity maps guest physical 0.. through a single present+writable
    /// 1 GiB page. Returns the PML4 guest physical offset for CR3.
    fn build_identity_map(&mut self) -> Result<u64> {
        let pml4_base = self.memory_size;
        let pdpt_base = pml4_base + PAGE_SIZE;

        let mut tables = GuestRam::new(2 * PAGE_SIZE as usize)?;
        let bytes = tables.as_mut_slice();
        let pml4e = pdpt_base | PTE_PRESENT | PTE_WRITABLE;
        bytes[..8].copy_from_slice(&pml4e.to_le_bytes());
        let pdpte = PTE_PRESENT | PTE_WRITABLE | PTE_PAGE_SIZE;
        let pdpt = &mut bytes[PAGE_SIZE as usize..];
        pdpt[..8].copy_from_slice(&pdpte.to_le_bytes());

        Self::register_region(&self.vm, 1, pml4_base, &tables)?;
        self.page_tables = Some(tables);
        debug!("identity map: pml4 at {:#x}", pml4_base);
        Ok(pml4_base)
    }

    /// Copies `code` to guest physical 0 and points RIP at it. RSP is set to
    /// the top of guest memory; nothing else changes. In real mode CS is
    /// forced back to 0:0 (KVM's reset value aims at the 0xffff0 vector).
    pub fn load_code(&mut self, code: &[u8]) -> Result<()> {
        if code.len() as u64 > self.memory_size {
            return Err(Error::InvalidArgument("code does not fit in guest memory"));
        }
        self.ram.as_mut_slice()[..code.len()].copy_from_slice(code);

        let mut regs = self.vcpu.get_regs().map_err(|err| Error::Ioctl {
            op: "KVM_GET_REGS",
            err,
        })?;
        regs.rip = 0;
        regs.rsp = self.memory_size;
        self.vcpu.set_regs(&regs).map_err(|err| Error::Ioctl {
            op: "KVM_SET_REGS",
            err,
        })?;

        if self.mode == CpuMode::Real16 {
            let mut sregs = self.vcpu.get_sregs().map_err(|err| Error::Ioctl {
                op: "KVM_GET_SREGS",
                err,
            })?;
            sregs.cs.selector = 0;
            sregs.cs.base = 0;
            // Real-mode guests must keep the 64 KiB limit or VM entry fails.
            sregs.cs.limit = 0xffff;
            self.vcpu.set_sregs(&sregs).map_err(|err| Error::Ioctl {
                op: "KVM_SET_SREGS",
                err,
            })?;
        }

        self.state = OperatingState::Runnable;
        Ok(())
    }

    /// Executes exactly one architectural instruction.
    ///
    /// The single-step debug control is re-armed on every call because KVM
    /// quietly drops it whenever registers are written.
    pub fn step(&mut self) -> Result<OperatingState> {
        match self.state {
            OperatingState::NoCodeLoaded => {
                return Err(Error::InvalidArgument("no code loaded"));
            }
            OperatingState::SingleStepError => {
                return Err(Error::GuestFault(
                    "stepping a guest in single-step error state".to_string(),
                ));
            }
            _ => {}
        }

        let dbg = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
            pad: 0,
            arch: Default::default(),
        };
        self.vcpu.set_guest_debug(&dbg).map_err(|err| Error::Ioctl {
            op: "KVM_SET_GUEST_DEBUG",
            err,
        })?;

        self.state = match self.vcpu.run() {
            Ok(VcpuExit::Debug(_)) => OperatingState::Runnable,
            Ok(VcpuExit::Hlt) => OperatingState::Halted,
            Ok(VcpuExit::Shutdown) => OperatingState::Shutdown,
            Ok(exit) => {
                warn!("unexpected exit while single stepping: {:?}", exit);
                OperatingState::SingleStepError
            }
            Err(err) => {
                self.state = OperatingState::SingleStepError;
                return Err(Error::Ioctl { op: "KVM_RUN", err });
            }
        };
        Ok(self.state)
    }

    /// Reads the complete register file off the vCPU.
    pub fn get_registers(&self) -> Result<RegisterSet> {
        let regs = self.vcpu.get_regs().map_err(|err| Error::Ioctl {
            op: "KVM_GET_REGS",
            err,
        })?;
        let sregs = self.vcpu.get_sregs().map_err(|err| Error::Ioctl {
            op: "KVM_GET_SREGS",
            err,
        })?;
        let xsave_area = self.vcpu.get_xsave().map_err(|err| Error::Ioctl {
            op: "KVM_GET_XSAVE",
            err,
        })?;

        let mut rs = RegisterSet {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rdi: regs.rdi,
            rsi: regs.rsi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rflags: regs.rflags,
            rip: regs.rip,
            cs: sregs.cs.selector,
            ds: sregs.ds.selector,
            es: sregs.es.selector,
            fs: sregs.fs.selector,
            gs: sregs.gs.selector,
            ss: sregs.ss.selector,
            cr0: sregs.cr0,
            cr2: sregs.cr2,
            cr3: sregs.cr3,
            cr4: sregs.cr4,
            cr8: sregs.cr8,
            efer: sregs.efer,
            idt: Table {
                base: sregs.idt.base,
                limit: sregs.idt.limit,
            },
            gdt: Table {
                base: sregs.gdt.base,
                limit: sregs.gdt.limit,
            },
            ..Default::default()
        };
        xsave::decode(xsave_area.region.as_bytes(), &self.layout, &mut rs);
        Ok(rs)
    }

    /// Writes `rs` to the vCPU.
    ///
    /// Segment selectors are deliberately ignored: the hidden descriptors
    /// installed by the mode setup are what actually drive address
    /// translation, and overwriting selectors without re-deriving descriptors
    /// would corrupt the CPU mode. In real mode the hidden bases are
    /// refreshed from the current selectors instead. XCR0 gains whatever
    /// component bits the new vector state needs; it is never cleared.
    pub fn set_registers(&mut self, rs: &RegisterSet) -> Result<()> {
        let regs = kvm_regs {
            rax: rs.rax,
            rbx: rs.rbx,
            rcx: rs.rcx,
            rdx: rs.rdx,
            rsi: rs.rsi,
            rdi: rs.rdi,
            rsp: rs.rsp,
            rbp: rs.rbp,
            r8: rs.r8,
            r9: rs.r9,
            r10: rs.r10,
            r11: rs.r11,
            r12: rs.r12,
            r13: rs.r13,
            r14: rs.r14,
            r15: rs.r15,
            rip: rs.rip,
            rflags: rs.rflags | RFLAGS_RESERVED,
        };
        self.vcpu.set_regs(&regs).map_err(|err| Error::Ioctl {
            op: "KVM_SET_REGS",
            err,
        })?;

        let mut sregs = self.vcpu.get_sregs().map_err(|err| Error::Ioctl {
            op: "KVM_GET_SREGS",
            err,
        })?;
        sregs.cr0 = rs.cr0;
        sregs.cr2 = rs.cr2;
        sregs.cr3 = rs.cr3;
        sregs.cr4 = rs.cr4;
        sregs.cr8 = rs.cr8;
        sregs.efer = rs.efer;
        sregs.idt.base = rs.idt.base;
        sregs.idt.limit = rs.idt.limit;
        sregs.gdt.base = rs.gdt.base;
        sregs.gdt.limit = rs.gdt.limit;
        if self.mode == CpuMode::Real16 {
            x86_64::refresh_real_mode_segments(&mut sregs);
        }
        self.vcpu.set_sregs(&sregs).map_err(|err| Error::Ioctl {
            op: "KVM_SET_SREGS",
            err,
        })?;

        let required = xsave::required_features(rs) & self.layout.supported_features();
        let mut xcrs = self.vcpu.get_xcrs().map_err(|err| Error::Ioctl {
            op: "KVM_GET_XCRS",
            err,
        })?;
        for xcr in &mut xcrs.xcrs[..xcrs.nr_xcrs as usize] {
            if xcr.xcr == 0 {
                xcr.value |= required;
            }
        }
        self.vcpu.set_xcrs(&xcrs).map_err(|err| Error::Ioctl {
            op: "KVM_SET_XCRS",
            err,
        })?;

        // Read-modify-write so the x87 state and any component this codec
        // does not handle survive.
        let mut xsave_area = self.vcpu.get_xsave().map_err(|err| Error::Ioctl {
            op: "KVM_GET_XSAVE",
            err,
        })?;
        let area = xsave_area.region.as_mut_bytes();
        xsave::encode(rs, &self.layout, area);
        // The kernel only commits components whose XSTATE_BV bit is set.
        let bv_bytes = &mut area[xsave::XSTATE_BV_OFFSET..xsave::XSTATE_BV_OFFSET + 8];
        let bv = u64::from_le_bytes(bv_bytes.try_into().unwrap()) | self.layout.supported_features();
        bv_bytes.copy_from_slice(&bv.to_le_bytes());
        self.vcpu.set_xsave(&xsave_area).map_err(|err| Error::Ioctl {
            op: "KVM_SET_XSAVE",
            err,
        })?;
        Ok(())
    }

    /// A copy of the user-visible guest physical memory. Page-table frames
    /// added for long mode are not part of it.
    pub fn dump_physical(&self) -> Vec<u8> {
        self.ram.as_slice().to_vec()
    }

    pub fn operating_state(&self) -> OperatingState {
        self.state
    }

    pub fn cpu_mode(&self) -> CpuMode {
        self.mode
    }

    /// Size in bytes of the user-visible guest physical memory.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Whether the full AVX-512 register file can be marshaled on this host.
    pub fn supports_avx512(&self) -> bool {
        self.layout.has_avx512()
    }
}
