// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interactive laboratory for x86 assembly on KVM.
//!
//! Assembles a NASM source file, runs it one instruction at a time in a
//! hardware-virtualized guest and lets the user walk the recorded execution
//! forwards and backwards with the full register file and guest memory
//! visible at every step.

use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use hypervisor::CpuMode;
use log::error;
use snapshot::History;

mod assembler;
mod runner;
mod ui;

use assembler::Code;
use runner::Runner;

fn parse_mode(value: &str) -> Result<CpuMode, String> {
    match value {
        "16" | "real" => Ok(CpuMode::Real16),
        "32" | "protected" => Ok(CpuMode::Protected32),
        "64" | "long" => Ok(CpuMode::Long64),
        _ => Err(format!("unknown cpu mode {:?} (expected 16, 32 or 64)", value)),
    }
}

#[derive(FromArgs)]
/// Run an assembly file one instruction at a time in a KVM guest.
struct Args {
    /// starting cpu mode: 16 (real), 32 (protected) or 64 (long); default 64
    #[argh(option, default = "CpuMode::Long64", from_str_fn(parse_mode))]
    mode: CpuMode,

    /// guest physical memory in 4 KiB pages; default 256
    #[argh(option, default = "256")]
    memory: u64,

    /// path to the NASM source file
    #[argh(positional)]
    source: PathBuf,
}

fn run(args: Args) -> anyhow::Result<()> {
    let code = Code::assemble(&args.source)
        .with_context(|| format!("assembling {}", args.source.display()))?;
    let history = History::new(args.mode, args.memory, code.bytes().to_vec())
        .context("creating the guest")?;
    Runner::new(code, history).run()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
