// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The time-travel log driving step, reverse-step and reset.

use std::sync::Arc;

use hypervisor::kvm::KvmVm;
use hypervisor::CpuMode;
use hypervisor::OperatingState;
use hypervisor::Result;
use log::info;

use crate::snapshot::Snapshot;

/// An ordered log of snapshots plus a cursor selecting the observable one.
///
/// Index 0 is the state right after loading the code, before any user
/// instruction ran. The engine is only consulted when the cursor sits at the
/// tip of the log; anywhere earlier, stepping just moves the cursor through
/// already-recorded states. The recorded future survives reverse-stepping —
/// walking forward again re-observes it without re-executing anything.
pub struct History {
    vm: KvmVm,
    code: Vec<u8>,
    memory_pages: u64,
    snapshots: Vec<Arc<Snapshot>>,
    cursor: usize,
}

impl History {
    /// Boots a guest in `mode` with `memory_pages` pages, loads `code` at
    /// physical 0 and records the root snapshot.
    pub fn new(mode: CpuMode, memory_pages: u64, code: Vec<u8>) -> Result<History> {
        let mut vm = KvmVm::new(mode, memory_pages)?;
        vm.load_code(&code)?;
        let root = Self::capture(&vm, None)?;
        Ok(History {
            vm,
            code,
            memory_pages,
            snapshots: vec![Arc::new(root)],
            cursor: 0,
        })
    }

    fn capture(vm: &KvmVm, base: Option<Arc<Snapshot>>) -> Result<Snapshot> {
        let registers = vm.get_registers()?;
        let memory = vm.dump_physical();
        Ok(Snapshot::new(base, registers, &memory, vm.cpu_mode()))
    }

    /// Moves one instruction forward.
    ///
    /// With recorded future ahead of the cursor this only advances the
    /// cursor. At the tip it single-steps the guest and appends a snapshot —
    /// including for a step that ends the run, so the terminal state is
    /// observable; after that, further calls return the terminal state
    /// without touching the guest until [`History::reset`].
    pub fn step(&mut self) -> Result<OperatingState> {
        if self.cursor + 1 < self.snapshots.len() {
            self.cursor += 1;
            return Ok(self.operating_state());
        }
        if self.vm.operating_state() != OperatingState::Runnable {
            return Ok(self.vm.operating_state());
        }

        let state = self.vm.step()?;
        let base = Arc::clone(&self.snapshots[self.cursor]);
        let snapshot = Self::capture(&self.vm, Some(base))?;
        self.snapshots.push(Arc::new(snapshot));
        self.cursor += 1;
        Ok(state)
    }

    /// Moves the cursor one recorded state back; a no-op at the root.
    pub fn reverse_step(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
        }
    }

    /// Tears the guest down, boots a fresh one in `mode` with the same code
    /// and memory size, and restarts the log from its root snapshot.
    pub fn reset(&mut self, mode: CpuMode) -> Result<()> {
        info!("resetting guest into {:?}", mode);
        let mut vm = KvmVm::new(mode, self.memory_pages)?;
        vm.load_code(&self.code)?;
        self.vm = vm;
        let root = Self::capture(&self.vm, None)?;
        self.snapshots.clear();
        self.snapshots.push(Arc::new(root));
        self.cursor = 0;
        Ok(())
    }

    /// The snapshot the cursor points at.
    pub fn current(&self) -> &Arc<Snapshot> {
        &self.snapshots[self.cursor]
    }

    /// The snapshot preceding the observable one, if any. This is what a
    /// front-end diffs the current registers against.
    pub fn previous(&self) -> Option<&Arc<Snapshot>> {
        self.cursor.checked_sub(1).map(|i| &self.snapshots[i])
    }

    pub fn at(&self, index: usize) -> Option<&Arc<Snapshot>> {
        self.snapshots.get(index)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of recorded snapshots (root included).
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// The state shown for the observable snapshot: a re-observed past state
    /// was necessarily runnable; only the tip can be terminal.
    pub fn operating_state(&self) -> OperatingState {
        if self.cursor + 1 == self.snapshots.len() {
            self.vm.operating_state()
        } else {
            OperatingState::Runnable
        }
    }

    pub fn cpu_mode(&self) -> CpuMode {
        self.vm.cpu_mode()
    }

    /// Whether the engine can marshal the AVX-512 register file.
    pub fn supports_avx512(&self) -> bool {
        self.vm.supports_avx512()
    }
}
