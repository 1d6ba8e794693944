// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Chains snapshots over a live long-mode guest that dirties every page of
//! its physical memory through the identity map. Skipped without /dev/kvm.

use std::sync::Arc;

use hypervisor::kvm::KvmVm;
use hypervisor::CpuMode;
use hypervisor::OperatingState;
use snapshot::Snapshot;

const PAGE_SIZE: u64 = 4096;
const MARKER: u64 = 0xdead_beef_cafe_babe;

#[test]
fn every_page_write_lands_in_its_snapshot() {
    if !std::path::Path::new("/dev/kvm").exists() {
        eprintln!("/dev/kvm not available, skipping");
        return;
    }

    const PAGES: u64 = 1024;
    let mut vm = KvmVm::new(CpuMode::Long64, PAGES).unwrap();
    // mov [rax], rcx; hlt — RIP is rewound before every step, so the hlt is
    // never reached.
    vm.load_code(&[0x48, 0x89, 0x08, 0xf4]).unwrap();

    let mut current = Arc::new(Snapshot::new(
        None,
        vm.get_registers().unwrap(),
        &vm.dump_physical(),
        vm.cpu_mode(),
    ));

    // Page 0 holds the code, so it goes last; clobbering it earlier would
    // leave nothing to execute.
    for page in (1..PAGES).chain([0]) {
        let mut regs = vm.get_registers().unwrap();
        regs.rax = page * PAGE_SIZE;
        regs.rcx = MARKER;
        regs.rip = 0;
        vm.set_registers(&regs).unwrap();
        assert_eq!(vm.step().unwrap(), OperatingState::Runnable);

        let snapshot = Arc::new(Snapshot::new(
            Some(Arc::clone(&current)),
            vm.get_registers().unwrap(),
            &vm.dump_physical(),
            vm.cpu_mode(),
        ));
        let read = snapshot.read_physical(page * PAGE_SIZE, 8);
        assert_eq!(u64::from_le_bytes(read.try_into().unwrap()), MARKER);
        current = snapshot;
    }

    // The final snapshot sees every marker at once.
    for page in 0..PAGES {
        let read = current.read_physical(page * PAGE_SIZE, 8);
        assert_eq!(
            u64::from_le_bytes(read.try_into().unwrap()),
            MARKER,
            "page {} lost its marker",
            page
        );
    }

    // Earlier snapshots were never retroactively modified: the root has no
    // markers outside page 0's code.
    let root = {
        let mut snap = &current;
        while let Some(base) = snap.base() {
            snap = base;
        }
        snap.clone()
    };
    assert_eq!(root.read_physical(PAGE_SIZE, 8), vec![0u8; 8]);
}
