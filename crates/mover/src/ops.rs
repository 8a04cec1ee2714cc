//! Filesystem primitives used by the mover.
//!
//! Kept behind a trait so tests can inject busy or cross-device failures
//! without needing a second mount or root-proof permissions.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Primitive operations a move is built from.
pub trait FileOps: Send + Sync {
    /// Returns whether anything (file, dir, dangling symlink) exists at `path`.
    fn try_exists(&self, path: &Path) -> io::Result<bool>;

    /// Atomic same-filesystem rename.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Copies `from` to `to` and syncs `to` to disk. Returns the byte count.
    fn copy_durable(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Returns whether both files have identical bytes.
    fn same_content(&self, a: &Path, b: &Path) -> io::Result<bool>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Makes directory entry changes in `dir` durable.
    fn sync_dir(&self, dir: &Path) -> io::Result<()>;
}

/// [`FileOps`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn try_exists(&self, path: &Path) -> io::Result<bool> {
        match std::fs::symlink_metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn copy_durable(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let n = std::fs::copy(from, to)?;
        File::open(to)?.sync_all()?;
        Ok(n)
    }

    fn same_content(&self, a: &Path, b: &Path) -> io::Result<bool> {
        let fa = File::open(a)?;
        let fb = File::open(b)?;
        if fa.metadata()?.len() != fb.metadata()?.len() {
            return Ok(false);
        }

        let mut ra = BufReader::new(fa);
        let mut rb = BufReader::new(fb);
        let mut buf_a = [0u8; 8192];
        let mut buf_b = [0u8; 8192];
        loop {
            let na = read_full(&mut ra, &mut buf_a)?;
            let nb = read_full(&mut rb, &mut buf_b)?;
            if na != nb || buf_a[..na] != buf_b[..nb] {
                return Ok(false);
            }
            if na == 0 {
                return Ok(true);
            }
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            File::open(dir)?.sync_all()
        }
        #[cfg(not(unix))]
        {
            let _ = dir;
            Ok(())
        }
    }
}

/// Reads until `buf` is full or EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
