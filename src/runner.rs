// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The main loop: pump user actions into the history until quit.

use anyhow::Context;
use anyhow::Result;
use hypervisor::x86_64::HostExtensions;
use hypervisor::OperatingState;
use log::info;
use snapshot::History;

use crate::assembler::Code;
use crate::ui::Action;
use crate::ui::Tui;

pub struct Runner {
    code: Code,
    history: History,
    ui: Tui,
}

impl Runner {
    pub fn new(code: Code, history: History) -> Runner {
        Runner {
            code,
            history,
            ui: Tui::new(),
        }
    }

    /// Runs until the user quits. Steps against a finished guest are
    /// reported and ignored; reset always works.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "loaded {} ({} bytes of code)",
            self.code.source().display(),
            self.code.bytes().len()
        );
        let ext = HostExtensions::get();
        info!(
            "host extensions: mmx={} sse={} sse2={} avx={} avx2={} avx512f={}",
            ext.mmx, ext.sse, ext.sse2, ext.avx, ext.avx2, ext.avx512f
        );
        loop {
            self.ui.render(&self.code, &self.history);
            match self.ui.next_action().context("reading user input")? {
                Action::Step => {
                    let state = self.history.step().context("single step failed")?;
                    if state != OperatingState::Runnable {
                        info!("guest is no longer runnable: {}", state);
                    }
                }
                Action::ReverseStep => self.history.reverse_step(),
                Action::Reset(mode) => {
                    self.history.reset(mode).context("resetting the guest")?;
                }
                Action::Quit => return Ok(()),
            }
        }
    }
}
