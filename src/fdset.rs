//! Thin wrapper around a select(2) descriptor set.
//!
//! The host process owns the multiplexing call; the bridge only marks its
//! descriptors in the read and error sets and tests which of them fired.

use std::mem;
use std::os::fd::RawFd;

use nix::libc;

pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> Self {
        let mut raw = mem::MaybeUninit::<libc::fd_set>::zeroed();
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            Self {
                raw: raw.assume_init(),
            }
        }
    }

    pub fn insert(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.raw) }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    /// Raw pointer for handing the set to `select(2)`.
    pub fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut set = FdSet::new();
        assert!(!set.contains(3));

        set.insert(3);
        set.insert(17);
        assert!(set.contains(3));
        assert!(set.contains(17));
        assert!(!set.contains(4));
    }

    #[test]
    fn test_new_set_is_empty() {
        let set = FdSet::new();
        for fd in 0..64 {
            assert!(!set.contains(fd));
        }
    }
}
