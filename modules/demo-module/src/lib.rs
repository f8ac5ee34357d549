//! WASI demo guest.
//!
//! Exports three independent operations to the host:
//!
//! - `add(a, b)` prints `Computing Addition` and returns the wrapping sum.
//! - `readFile()` prints the contents of `/usr/src/app/test.txt` and returns `0`.
//! - `_start()` prints `Idling...` and never returns.
//!
//! The logic lives in plain functions that take any [`Write`] sink so it can be
//! unit tested on the native target. The `extern "C"` exports only exist when
//! compiling for wasm and bind those functions to the process stdout.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// The only path `readFile` ever opens.
pub const APP_FILE: &str = "/usr/src/app/test.txt";

pub const ADD_BANNER: &str = "Computing Addition";
pub const IDLE_BANNER: &str = "Idling...";

/// How long each idle iteration blocks in the host clock before re-checking.
pub const IDLE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ReadFileError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not valid UTF-8 text")]
    Decode { path: String },

    #[error("failed to print contents of {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Prints the addition banner, then returns `a + b` with two's complement wraparound.
pub fn add_to(out: &mut impl Write, a: i32, b: i32) -> io::Result<i32> {
    writeln!(out, "{ADD_BANNER}")?;
    Ok(a.wrapping_add(b))
}

/// Reads the whole file at `path` as UTF-8 text.
pub fn read_contents(path: &Path) -> Result<String, ReadFileError> {
    let display = path.display().to_string();
    let mut file = File::open(path).map_err(|source| ReadFileError::Open {
        path: display.clone(),
        source,
    })?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|source| ReadFileError::Read {
            path: display.clone(),
            source,
        })?;

    String::from_utf8(bytes).map_err(|_| ReadFileError::Decode { path: display })
}

/// Prints the contents of `path` as one console line and returns `0`.
pub fn echo_file(out: &mut impl Write, path: &Path) -> Result<i32, ReadFileError> {
    let contents = read_contents(path)?;
    writeln!(out, "{contents}")
        .and_then(|()| out.flush())
        .map_err(|source| ReadFileError::Write {
            path: path.display().to_string(),
            source,
        })?;
    Ok(0)
}

/// Prints the idle banner, then blocks in [`IDLE_TICK`] sleeps for as long as
/// `keep_running` says so.
///
/// Each sleep is a `poll_oneoff` clock wait on WASI, so an idling guest does
/// not burn a core and the host gets a chance to interrupt it every tick.
pub fn idle(out: &mut impl Write, mut keep_running: impl FnMut() -> bool) -> io::Result<()> {
    writeln!(out, "{IDLE_BANNER}")?;
    out.flush()?;

    while keep_running() {
        std::thread::sleep(IDLE_TICK);
    }
    Ok(())
}

#[cfg(target_family = "wasm")]
mod exports {
    use std::io;
    use std::path::Path;

    // Console failures are as fatal as they are for `println!`.

    #[no_mangle]
    pub extern "C" fn add(a: i32, b: i32) -> i32 {
        match super::add_to(&mut io::stdout().lock(), a, b) {
            Ok(sum) => sum,
            Err(err) => panic!("failed printing to stdout: {err}"),
        }
    }

    #[export_name = "readFile"]
    pub extern "C" fn read_file() -> i32 {
        match super::echo_file(&mut io::stdout().lock(), Path::new(super::APP_FILE)) {
            Ok(code) => code,
            // Any open, decode or print failure is fatal: the host sees a trap, never a value.
            Err(err) => panic!("{err}"),
        }
    }

    #[no_mangle]
    pub extern "C" fn _start() {
        if let Err(err) = super::idle(&mut io::stdout(), || true) {
            panic!("failed printing to stdout: {err}");
        }
    }
}
