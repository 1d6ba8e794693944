// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests of the KVM engine. Guest code is hand-assembled; every
//! test that actually enters a guest is skipped on hosts without /dev/kvm.

use hypervisor::kvm::KvmVm;
use hypervisor::vector::Vec128;
use hypervisor::vector::Vec256;
use hypervisor::vector::Vec64;
use hypervisor::x86_64::HostExtensions;
use hypervisor::x86_64::RFLAGS_IF;
use hypervisor::x86_64::RFLAGS_PF;
use hypervisor::CpuMode;
use hypervisor::Error;
use hypervisor::OperatingState;

fn kvm_available() -> bool {
    if std::path::Path::new("/dev/kvm").exists() {
        return true;
    }
    eprintln!("/dev/kvm not available, skipping");
    false
}

#[test]
fn zero_memory_is_rejected() {
    match KvmVm::new(CpuMode::Long64, 0) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn code_must_fit_in_memory() {
    if !kvm_available() {
        return;
    }
    let mut vm = KvmVm::new(CpuMode::Real16, 1).unwrap();
    match vm.load_code(&[0x90; 8192]) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn step_without_code_is_an_error() {
    if !kvm_available() {
        return;
    }
    let mut vm = KvmVm::new(CpuMode::Long64, 4).unwrap();
    assert_eq!(vm.operating_state(), OperatingState::NoCodeLoaded);
    assert!(matches!(vm.step(), Err(Error::InvalidArgument(_))));
}

#[test]
fn protected_mode_runs_flat_ring0() {
    if !kvm_available() {
        return;
    }
    let mut vm = KvmVm::new(CpuMode::Protected32, 4).unwrap();
    // inc eax; hlt
    vm.load_code(&[0x40, 0xf4]).unwrap();

    let regs = vm.get_registers().unwrap();
    assert_eq!(regs.cs, 0x8);
    assert_eq!(regs.ds, 0x10);
    assert_eq!(regs.cr0 & 1, 1);
    assert_eq!(regs.rip, 0);
    assert_eq!(regs.rsp, 4 * 4096);

    assert_eq!(vm.step().unwrap(), OperatingState::Runnable);
    let regs = vm.get_registers().unwrap();
    assert_eq!(regs.rax, 1);
    assert_eq!(regs.rip, 1);

    assert_eq!(vm.step().unwrap(), OperatingState::Halted);
}

// Seeds all sixteen GPRs, shifts each left by one byte, and checks the
// register file plus the arithmetic flags land exactly where the ISA says.
#[test]
fn long_mode_shifts_every_gpr() {
    if !kvm_available() {
        return;
    }

    // shl r64, imm8 is C1 /4 ib; low eight registers with REX.W, r8-r15 with
    // REX.WB. Ordered rax,rbx,rcx,rdx,rdi,rsi,rbp,rsp then r8..r15.
    let order: [u8; 8] = [0, 3, 1, 2, 7, 6, 5, 4];
    let mut code = Vec::new();
    for rm in order {
        code.extend([0x48, 0xc1, 0xe0 | rm, 0x08]);
    }
    for rm in 0..8u8 {
        code.extend([0x49, 0xc1, 0xe0 | rm, 0x08]);
    }
    code.extend([0xfa, 0xf4]); // cli; hlt
    let code_len = code.len() as u64;

    let mut vm = KvmVm::new(CpuMode::Long64, 16).unwrap();
    vm.load_code(&code).unwrap();

    let seed = |b: u8| u64::from_le_bytes([b; 8]) >> 8; // 0x00bb..bb
    let seeds: [u8; 16] = [
        0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
        0x15,
    ];
    let mut regs = vm.get_registers().unwrap();
    regs.rax = seed(seeds[0]);
    regs.rbx = seed(seeds[1]);
    regs.rcx = seed(seeds[2]);
    regs.rdx = seed(seeds[3]);
    regs.rdi = seed(seeds[4]);
    regs.rsi = seed(seeds[5]);
    regs.rbp = seed(seeds[6]);
    regs.rsp = seed(seeds[7]);
    regs.r8 = seed(seeds[8]);
    regs.r9 = seed(seeds[9]);
    regs.r10 = seed(seeds[10]);
    regs.r11 = seed(seeds[11]);
    regs.r12 = seed(seeds[12]);
    regs.r13 = seed(seeds[13]);
    regs.r14 = seed(seeds[14]);
    regs.r15 = seed(seeds[15]);
    vm.set_registers(&regs).unwrap();

    for _ in 0..16 {
        assert_eq!(vm.step().unwrap(), OperatingState::Runnable);
    }
    assert_eq!(vm.step().unwrap(), OperatingState::Runnable); // cli
    assert_eq!(vm.step().unwrap(), OperatingState::Halted); // hlt

    let regs = vm.get_registers().unwrap();
    assert_eq!(regs.rax, seed(seeds[0]) << 8);
    assert_eq!(regs.rbx, seed(seeds[1]) << 8);
    assert_eq!(regs.rcx, seed(seeds[2]) << 8);
    assert_eq!(regs.rdx, seed(seeds[3]) << 8);
    assert_eq!(regs.rdi, seed(seeds[4]) << 8);
    assert_eq!(regs.rsi, seed(seeds[5]) << 8);
    assert_eq!(regs.rbp, seed(seeds[6]) << 8);
    assert_eq!(regs.rsp, seed(seeds[7]) << 8);
    assert_eq!(regs.r8, seed(seeds[8]) << 8);
    assert_eq!(regs.r9, seed(seeds[9]) << 8);
    assert_eq!(regs.r10, seed(seeds[10]) << 8);
    assert_eq!(regs.r11, seed(seeds[11]) << 8);
    assert_eq!(regs.r12, seed(seeds[12]) << 8);
    assert_eq!(regs.r13, seed(seeds[13]) << 8);
    assert_eq!(regs.r14, seed(seeds[14]) << 8);
    assert_eq!(regs.r15, seed(seeds[15]) << 8);

    // cli cleared IF; the last shl left a zero low byte, so parity is even.
    assert_eq!(regs.rflags & RFLAGS_IF, 0);
    assert_ne!(regs.rflags & RFLAGS_PF, 0);
    assert_eq!(regs.rip, code_len);
}

// A real-mode guest reloading every segment register through its own code;
// the selectors must show up in the register file as the guest set them.
#[test]
fn real_mode_segment_loads() {
    if !kvm_available() {
        return;
    }

    let mut code = vec![0xea, 0x05, 0x00, 0x01, 0x00]; // jmp 0x1:0x5
    code.resize(0x15, 0x90); // pad so cs.base 0x10 + ip 0x5 lands here
    let mov_sreg = |imm: u16, modrm: u8| {
        let [lo, hi] = imm.to_le_bytes();
        [0xb8, lo, hi, 0x8e, modrm]
    };
    code.extend(mov_sreg(0xdddd, 0xd8)); // mov ax, ..; mov ds, ax
    code.extend(mov_sreg(0xeeee, 0xc0)); // mov es, ax
    code.extend(mov_sreg(0xffff, 0xe0)); // mov fs, ax
    code.extend(mov_sreg(0x1111, 0xe8)); // mov gs, ax
    code.extend(mov_sreg(0x2222, 0xd0)); // mov ss, ax
    code.extend([0x90, 0xf4]); // nop; hlt

    let mut vm = KvmVm::new(CpuMode::Real16, 4).unwrap();
    vm.load_code(&code).unwrap();
    let regs = vm.get_registers().unwrap();
    assert_eq!(regs.cs, 0);

    assert_eq!(vm.step().unwrap(), OperatingState::Runnable);
    let regs = vm.get_registers().unwrap();
    assert_eq!(regs.cs, 0x1);
    assert_eq!(regs.rip, 0x5);

    let mut expect_selector = |expected: &dyn Fn(&hypervisor::RegisterSet) -> u16, value: u16| {
        vm.step().unwrap(); // mov ax, imm
        vm.step().unwrap(); // mov sreg, ax
        let regs = vm.get_registers().unwrap();
        assert_eq!(expected(&regs), value);
    };
    expect_selector(&|r| r.ds, 0xdddd);
    expect_selector(&|r| r.es, 0xeeee);
    expect_selector(&|r| r.fs, 0xffff);
    expect_selector(&|r| r.gs, 0x1111);
    // mov ss suppresses the single-step trap for one instruction, so this
    // step carries execution through the following nop as well.
    expect_selector(&|r| r.ss, 0x2222);

    assert_eq!(vm.step().unwrap(), OperatingState::Halted);
}

#[test]
fn set_registers_ignores_selectors() {
    if !kvm_available() {
        return;
    }
    let mut vm = KvmVm::new(CpuMode::Protected32, 4).unwrap();
    vm.load_code(&[0x90, 0xf4]).unwrap();

    let before = vm.get_registers().unwrap();
    let mut wanted = before.clone();
    wanted.rax = 0x4242_4242;
    wanted.rdx = 77;
    wanted.cs = 0x1234;
    wanted.ds = 0x5678;
    wanted.ss = 0x9abc;
    wanted.idt.base = 0x3000;
    wanted.idt.limit = 0x7ff;
    wanted.gdt.base = 0x2000;
    wanted.gdt.limit = 0x17;
    vm.set_registers(&wanted).unwrap();

    let after = vm.get_registers().unwrap();
    // Selector writes are dropped on the floor...
    assert_eq!(after.cs, before.cs);
    assert_eq!(after.ds, before.ds);
    assert_eq!(after.ss, before.ss);
    // ...while everything else takes.
    assert_eq!(after.rax, 0x4242_4242);
    assert_eq!(after.rdx, 77);
    assert_eq!(after.idt, wanted.idt);
    assert_eq!(after.gdt, wanted.gdt);
}

#[test]
fn vector_state_round_trips_through_the_vcpu() {
    if !kvm_available() {
        return;
    }
    let ext = HostExtensions::get();
    let mut vm = KvmVm::new(CpuMode::Long64, 4).unwrap();
    vm.load_code(&[0x90, 0xf4]).unwrap();

    let mut regs = vm.get_registers().unwrap();
    for i in 0..8 {
        regs.mmx[i] = Vec64::from_elems(&[0x0123_4567_89ab_cdefu64 ^ (i as u64)]);
    }
    for i in 0..16 {
        regs.set_xmm(i, Vec128::from_elems(&[i as u64 + 1, !(i as u64)]));
    }
    if ext.avx {
        for i in 0..16 {
            let mut ymm = Vec256::zero();
            ymm.set_elem(0, i as u64 + 1);
            ymm.set_elem(3, 0xdead_0000 + i as u64);
            regs.set_ymm(i, ymm);
        }
    }
    if vm.supports_avx512() {
        for i in 0..32 {
            regs.zmm[i].set_elem(7, 0xabcd_0000_0000_0000u64 + i as u64);
        }
        for i in 0..8 {
            regs.k[i] = 0x8001 + i as u64;
        }
    }
    vm.set_registers(&regs).unwrap();

    let read_back = vm.get_registers().unwrap();
    assert_eq!(read_back.mmx, regs.mmx);
    assert_eq!(read_back.zmm, regs.zmm);
    assert_eq!(read_back.k, regs.k);
}

// Loads a 64-byte pattern into ZMM7 with an AVX-512 instruction executed by
// the guest itself, then reads it back through the XSAVE codec.
#[test]
fn avx512_zmm_load_is_visible() {
    if !kvm_available() {
        return;
    }
    let mut vm = KvmVm::new(CpuMode::Long64, 16).unwrap();
    if !vm.supports_avx512() {
        eprintln!("host has no AVX-512, skipping");
        return;
    }

    const PATTERN_OFFSET: usize = 0x800;
    // vmovdqu64 zmm7, [rsp]; hlt
    let mut image = vec![0u8; PATTERN_OFFSET + 64];
    image[..8].copy_from_slice(&[0x62, 0xf1, 0xfe, 0x48, 0x6f, 0x3c, 0x24, 0xf4]);
    for (i, b) in image[PATTERN_OFFSET..].iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7).wrapping_add(3);
    }
    vm.load_code(&image).unwrap();

    let mut regs = vm.get_registers().unwrap();
    regs.rsp = PATTERN_OFFSET as u64;
    regs.cr4 |= 1 << 18; // OSXSAVE, so the guest may use AVX-512
    regs.k[1] = 1; // forces the AVX-512 XCR0 bits on before the guest runs
    vm.set_registers(&regs).unwrap();

    assert_eq!(vm.step().unwrap(), OperatingState::Runnable);
    let regs = vm.get_registers().unwrap();
    assert_eq!(regs.zmm[7].as_bytes()[..], image[PATTERN_OFFSET..]);
    assert_eq!(regs.k[1], 1);

    assert_eq!(vm.step().unwrap(), OperatingState::Halted);
}

// A fault the engine cannot step over (ud2 with no IDT) must shut the guest
// down, and the dump must only cover user-visible memory.
#[test]
fn triple_fault_shuts_down() {
    if !kvm_available() {
        return;
    }
    let mut vm = KvmVm::new(CpuMode::Long64, 8).unwrap();
    vm.load_code(&[0x0f, 0x0b]).unwrap(); // ud2
    assert_eq!(vm.step().unwrap(), OperatingState::Shutdown);
    assert_eq!(vm.operating_state(), OperatingState::Shutdown);
    // The long-mode page-table frames live past the reported memory.
    assert_eq!(vm.dump_physical().len(), 8 * 4096);
}
