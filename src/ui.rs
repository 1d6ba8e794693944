// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Line-oriented terminal front-end.
//!
//! Strictly a pull model: after every action the current snapshot is
//! rendered from scratch through the history's query interface, and the next
//! action is read from stdin. The front-end never holds guest state of its
//! own beyond the snapshot handles it is given.

use std::io;
use std::io::BufRead;
use std::io::Write;

use hypervisor::x86_64::RFLAGS_AF;
use hypervisor::x86_64::RFLAGS_CF;
use hypervisor::x86_64::RFLAGS_DF;
use hypervisor::x86_64::RFLAGS_IF;
use hypervisor::x86_64::RFLAGS_OF;
use hypervisor::x86_64::RFLAGS_PF;
use hypervisor::x86_64::RFLAGS_SF;
use hypervisor::x86_64::RFLAGS_TF;
use hypervisor::x86_64::RFLAGS_ZF;
use hypervisor::CpuMode;
use hypervisor::RegisterSet;
use snapshot::History;
use snapshot::Snapshot;

use crate::assembler::Code;

/// What the user wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Step,
    ReverseStep,
    Reset(CpuMode),
    Quit,
}

pub struct Tui {
    stdin: io::BufReader<io::Stdin>,
}

impl Tui {
    pub fn new() -> Tui {
        Tui {
            stdin: io::BufReader::new(io::stdin()),
        }
    }

    /// Renders the observable snapshot: status line, the source line at RIP,
    /// the register file with change markers against the previous snapshot,
    /// and a small stack window.
    pub fn render(&self, code: &Code, history: &History) {
        let snapshot = history.current();
        let previous = history.previous().map(|s| s.registers().clone());
        let regs = snapshot.registers();

        println!(
            "--- step {}/{}  {:?}  [{}] ---",
            history.cursor(),
            history.len() - 1,
            snapshot.cpu_mode(),
            history.operating_state(),
        );
        if let Some(number) = code.line_for_offset(regs.rip) {
            match code.source_line(number) {
                Some(text) => println!("{:>5} | {}", number, text),
                None => println!("{:>5} |", number),
            }
        }
        print_registers(regs, previous.as_ref());
        print_stack(snapshot, regs);
    }

    /// Blocks until the user enters a valid action. EOF quits.
    pub fn next_action(&mut self) -> io::Result<Action> {
        loop {
            print!("(s)tep (b)ack (r16/r32/r64)eset (q)uit> ");
            io::stdout().flush()?;
            let mut line = String::new();
            if self.stdin.read_line(&mut line)? == 0 {
                return Ok(Action::Quit);
            }
            match line.trim() {
                "" | "s" | "step" => return Ok(Action::Step),
                "b" | "back" => return Ok(Action::ReverseStep),
                "r16" => return Ok(Action::Reset(CpuMode::Real16)),
                "r32" => return Ok(Action::Reset(CpuMode::Protected32)),
                "r64" => return Ok(Action::Reset(CpuMode::Long64)),
                "q" | "quit" => return Ok(Action::Quit),
                other => println!("unknown command: {:?}", other),
            }
        }
    }
}

/// Appends a change marker when `current` differs from the previous value.
fn mark(changed: bool) -> &'static str {
    if changed {
        "*"
    } else {
        " "
    }
}

fn print_registers(regs: &RegisterSet, previous: Option<&RegisterSet>) {
    let prev = previous.cloned().unwrap_or_else(|| regs.clone());

    let pairs: [(&str, u64, u64); 18] = [
        ("rax", regs.rax, prev.rax),
        ("rbx", regs.rbx, prev.rbx),
        ("rcx", regs.rcx, prev.rcx),
        ("rdx", regs.rdx, prev.rdx),
        ("rdi", regs.rdi, prev.rdi),
        ("rsi", regs.rsi, prev.rsi),
        ("rbp", regs.rbp, prev.rbp),
        ("rsp", regs.rsp, prev.rsp),
        ("r8 ", regs.r8, prev.r8),
        ("r9 ", regs.r9, prev.r9),
        ("r10", regs.r10, prev.r10),
        ("r11", regs.r11, prev.r11),
        ("r12", regs.r12, prev.r12),
        ("r13", regs.r13, prev.r13),
        ("r14", regs.r14, prev.r14),
        ("r15", regs.r15, prev.r15),
        ("rip", regs.rip, prev.rip),
        ("rfl", regs.rflags, prev.rflags),
    ];
    for row in pairs.chunks(2) {
        let mut line = String::new();
        for (name, cur, old) in row {
            line.push_str(&format!(
                "{} = 0x{:016x}{}\t",
                name,
                cur,
                mark(cur != old)
            ));
        }
        println!("{}", line.trim_end());
    }
    println!("flags: {}", decode_rflags(regs.rflags));

    println!(
        "cs = 0x{:04x}{} ds = 0x{:04x}{} es = 0x{:04x}{} fs = 0x{:04x}{} gs = 0x{:04x}{} ss = 0x{:04x}{}",
        regs.cs,
        mark(regs.cs != prev.cs),
        regs.ds,
        mark(regs.ds != prev.ds),
        regs.es,
        mark(regs.es != prev.es),
        regs.fs,
        mark(regs.fs != prev.fs),
        regs.gs,
        mark(regs.gs != prev.gs),
        regs.ss,
        mark(regs.ss != prev.ss),
    );
    println!(
        "cr0 = 0x{:016x}{}\tcr2 = 0x{:016x}{}",
        regs.cr0,
        mark(regs.cr0 != prev.cr0),
        regs.cr2,
        mark(regs.cr2 != prev.cr2),
    );
    println!(
        "cr3 = 0x{:016x}{}\tcr4 = 0x{:016x}{}",
        regs.cr3,
        mark(regs.cr3 != prev.cr3),
        regs.cr4,
        mark(regs.cr4 != prev.cr4),
    );
    println!(
        "cr8 = 0x{:016x}{}\tefer = 0x{:016x}{}",
        regs.cr8,
        mark(regs.cr8 != prev.cr8),
        regs.efer,
        mark(regs.efer != prev.efer),
    );
    println!(
        "idt: base = 0x{:016x} limit = 0x{:04x}\tgdt: base = 0x{:016x} limit = 0x{:04x}",
        regs.idt.base, regs.idt.limit, regs.gdt.base, regs.gdt.limit,
    );

    // The vector file is huge and mostly zero; show only live registers.
    for (i, mm) in regs.mmx.iter().enumerate() {
        if !mm.is_zero() {
            println!("mm{} = {:?}", i, mm);
        }
    }
    for (i, zmm) in regs.zmm.iter().enumerate() {
        if !zmm.is_zero() {
            println!("zmm{:<2} = {:?}", i, zmm);
        }
    }
    for (i, k) in regs.k.iter().enumerate() {
        if *k != 0 {
            println!("k{} = 0x{:016x}", i, k);
        }
    }
    println!("mxcsr = 0x{:08x}", regs.mxcsr);
}

fn decode_rflags(rflags: u64) -> String {
    let names = [
        (RFLAGS_CF, "CF"),
        (RFLAGS_PF, "PF"),
        (RFLAGS_AF, "AF"),
        (RFLAGS_ZF, "ZF"),
        (RFLAGS_SF, "SF"),
        (RFLAGS_TF, "TF"),
        (RFLAGS_IF, "IF"),
        (RFLAGS_DF, "DF"),
        (RFLAGS_OF, "OF"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| rflags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "(none)".to_string()
    } else {
        set.join(" ")
    }
}

/// Eight quadwords starting at RSP. Paged modes read linear memory so the
/// window follows whatever the guest mapped there; otherwise physical.
fn print_stack(snapshot: &Snapshot, regs: &RegisterSet) {
    const CR0_PG: u64 = 1 << 31;
    const WINDOW: u64 = 64;

    if regs.rsp >= snapshot.memory_size() {
        // Fresh guest: the stack pointer sits just past the top of memory.
        return;
    }
    let bytes = if regs.cr0 & CR0_PG != 0 {
        snapshot.read_linear(regs.rsp, WINDOW)
    } else {
        snapshot.read_physical(regs.rsp, WINDOW)
    };
    for (i, qword) in bytes.chunks_exact(8).enumerate() {
        let value = u64::from_le_bytes(qword.try_into().unwrap());
        println!("  [rsp+0x{:02x}] 0x{:016x}", i * 8, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rflags_decoding() {
        assert_eq!(decode_rflags(0x2), "(none)");
        assert_eq!(decode_rflags(0x2 | RFLAGS_ZF | RFLAGS_IF), "ZF IF");
        assert_eq!(decode_rflags(RFLAGS_CF | RFLAGS_OF), "CF OF");
    }
}
