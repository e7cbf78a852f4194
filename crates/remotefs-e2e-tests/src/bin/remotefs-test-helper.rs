// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Small programs exercising intercepted file calls. Each subcommand exits
//! non-zero when the observed behavior differs from the expectation given on
//! the command line.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "remotefs-test-helper")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Read a whole file and compare it with the expected text
    Read {
        path: PathBuf,
        #[arg(long)]
        expect: String,
    },
    /// Create or truncate a file and write the text into it
    Write {
        path: PathBuf,
        #[arg(long)]
        text: String,
    },
    /// Append the text to an existing file
    Append {
        path: PathBuf,
        #[arg(long)]
        text: String,
    },
    /// Query the position with a zero relative seek around a full read
    Seek {
        path: PathBuf,
        #[arg(long)]
        expect: String,
    },
    /// Check permissions; with --expect-errno the call must fail that way
    Access {
        path: PathBuf,
        #[arg(long, default_value_t = libc::F_OK)]
        mode: i32,
        #[arg(long)]
        expect_errno: Option<i32>,
    },
    /// Print directory entry names, one per line, in enumeration order
    List { path: PathBuf },
}

fn read(path: PathBuf, expect: String) -> Result<()> {
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    ensure!(contents == expect, "expected {expect:?}, got {contents:?}");
    print!("{contents}");
    Ok(())
}

fn write(path: PathBuf, text: String) -> Result<()> {
    let mut file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

fn append(path: PathBuf, text: String) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())?;
    let position = file.stream_position()?;
    println!("{position}");
    Ok(())
}

fn seek(path: PathBuf, expect: String) -> Result<()> {
    let mut file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    ensure!(file.seek(SeekFrom::Current(0))? == 0, "fresh descriptor not at 0");

    let mut buf = vec![0u8; expect.len()];
    file.read_exact(&mut buf)?;
    ensure!(buf == expect.as_bytes(), "unexpected contents {:?}", String::from_utf8_lossy(&buf));

    let position = file.seek(SeekFrom::Current(0))?;
    ensure!(position == expect.len() as u64, "position {position} after full read");

    let end = file.seek(SeekFrom::End(0))?;
    ensure!(end == expect.len() as u64, "end offset {end}");
    Ok(())
}

fn access(path: PathBuf, mode: i32, expect_errno: Option<i32>) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let result = unsafe { libc::access(c_path.as_ptr(), mode) };
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    match (result, expect_errno) {
        (0, None) => Ok(()),
        (0, Some(expected)) => bail!("access succeeded, expected errno {expected}"),
        (_, Some(expected)) if errno == expected => Ok(()),
        (_, _) => bail!("access failed with errno {errno}"),
    }
}

fn list(path: PathBuf) -> Result<()> {
    for entry in fs::read_dir(&path).with_context(|| format!("failed to list {}", path.display()))? {
        println!("{}", entry?.file_name().to_string_lossy());
    }
    Ok(())
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Cmd::Read { path, expect } => read(path, expect),
        Cmd::Write { path, text } => write(path, text),
        Cmd::Append { path, text } => append(path, text),
        Cmd::Seek { path, expect } => seek(path, expect),
        Cmd::Access {
            path,
            mode,
            expect_errno,
        } => access(path, mode, expect_errno),
        Cmd::List { path } => list(path),
    }
}
