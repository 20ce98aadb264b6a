// File-system collaborator
//
// The backing file system is not reentrant, so every call into it happens
// under the single file-system lock. `BackingFile` methods take the lock's
// guard as an argument, which makes "called without the lock" a type error
// instead of a latent race.
//
// Lock order: the file-system lock and the VM lock are never held at the
// same time. Paths that need both drop one before taking the other.

use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};

pub type FsGuard<'a> = MutexGuard<'a, ()>;

pub struct FsLock {
    inner: Mutex<()>,
}

impl FsLock {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(()) }
    }

    pub fn lock(&self) -> FsGuard<'_> {
        self.inner.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl Default for FsLock {
    fn default() -> Self {
        Self::new()
    }
}

pub type FileHandle = Arc<dyn BackingFile>;

pub trait BackingFile: Send + Sync {
    /// Seeks to `offset` and reads up to `buf.len()` bytes; returns bytes read.
    fn read_at(&self, fs: &FsGuard<'_>, buf: &mut [u8], offset: u64) -> usize;
    /// Writes `buf` at `offset` without extending past end of file; returns bytes written.
    fn write_at(&self, fs: &FsGuard<'_>, buf: &[u8], offset: u64) -> usize;
    fn length(&self, fs: &FsGuard<'_>) -> u64;
    /// Opens an independent handle (own position) to the same inode.
    fn reopen(&self, fs: &FsGuard<'_>) -> Option<FileHandle>;
    fn close(&self, fs: &FsGuard<'_>);
}
