// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Driver for the external NASM assembler.
//!
//! The source file is assembled with `-f bin` so the output is raw machine
//! code with no container format, plus a listing file whose first 40 columns
//! carry the source line number and, for emitting lines, the code offset.
//! The listing gives the offset → line map the front-end uses to highlight
//! the instruction at RIP.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::result;

use log::debug;
use remain::sorted;
use tempfile::NamedTempFile;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// The assembler binary could not be spawned at all.
    #[error("failed to run nasm: {0}")]
    Launch(#[source] std::io::Error),
    /// Reading the assembler's output files back failed.
    #[error("failed to read assembler output: {0}")]
    Output(#[source] std::io::Error),
    /// The assembler exited nonzero; its stderr explains why.
    #[error("nasm rejected the source:\n{stderr}")]
    Rejected { stderr: String },
    /// No temporary file for the assembler outputs.
    #[error("failed to create a temporary file: {0}")]
    TempFile(#[source] std::io::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Assembled machine code plus the offset → source-line map.
pub struct Code {
    source: PathBuf,
    source_lines: Vec<String>,
    bytes: Vec<u8>,
    line_map: BTreeMap<u64, u64>,
}

impl Code {
    /// Assembles `source` with NASM. The temporary output and listing files
    /// are unlinked when this returns.
    pub fn assemble(source: &Path) -> Result<Code> {
        let output_file = NamedTempFile::new().map_err(Error::TempFile)?;
        let listing_file = NamedTempFile::new().map_err(Error::TempFile)?;

        let output = Command::new("nasm")
            .arg("-f")
            .arg("bin")
            .arg("-l")
            .arg(listing_file.path())
            .arg("-o")
            .arg(output_file.path())
            .arg(source)
            .output()
            .map_err(Error::Launch)?;
        if !output.status.success() {
            return Err(Error::Rejected {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let bytes = std::fs::read(output_file.path()).map_err(Error::Output)?;
        let listing = std::fs::read_to_string(listing_file.path()).map_err(Error::Output)?;
        let line_map = parse_listing(&listing);
        let source_lines = std::fs::read_to_string(source)
            .map_err(Error::Output)?
            .lines()
            .map(str::to_owned)
            .collect();
        debug!(
            "assembled {}: {} bytes, {} mapped offsets",
            source.display(),
            bytes.len(),
            line_map.len()
        );

        Ok(Code {
            source: source.to_owned(),
            source_lines,
            bytes,
            line_map,
        })
    }

    /// The raw machine code, loaded at guest physical 0.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The 1-based source line that emitted the instruction containing
    /// `offset`, if any.
    pub fn line_for_offset(&self, offset: u64) -> Option<u64> {
        self.line_map.range(..=offset).next_back().map(|(_, l)| *l)
    }

    /// The text of 1-based source line `number`.
    pub fn source_line(&self, number: u64) -> Option<&str> {
        self.source_lines
            .get(number.checked_sub(1)? as usize)
            .map(String::as_str)
    }
}

/// Extracts the offset → line map from a NASM listing. Lines that emit no
/// code (directives, macros) have no offset column and are skipped, as are
/// the unnumbered continuation rows of long instructions.
fn parse_listing(listing: &str) -> BTreeMap<u64, u64> {
    const HEADER_WIDTH: usize = 40;

    let mut map = BTreeMap::new();
    for line in listing.lines() {
        let Some(header) = line.get(..HEADER_WIDTH) else {
            continue;
        };
        let mut fields = header.split_whitespace();
        let Some(number) = fields.next().and_then(|t| t.parse::<u64>().ok()) else {
            continue;
        };
        let offset = fields
            .next()
            .filter(|t| t.len() == 8)
            .and_then(|t| u64::from_str_radix(t, 16).ok());
        if let Some(offset) = offset {
            map.entry(offset).or_insert(number);
        }
    }
    map
}
