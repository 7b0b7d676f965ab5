//! Cache entries
//!
//! Entries move UNCLAIMED -> CLAIMED -> COMPILED | FAILED. The terminal states
//! are only left by dropping the whole table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared handle to a cache entry
pub type EntryRef<A> = Arc<CacheEntry<A>>;

/// Lifecycle state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unclaimed,
    Claimed,
    Compiled,
    Failed,
}

/// Compiled payload of an entry
#[derive(Debug)]
pub struct CompiledProgram<A> {
    /// Backend bytecode (empty for passthrough)
    pub bytecode: Vec<u8>,
    /// Bindable object; `None` means "bind nothing" (passthrough)
    pub artifact: Option<A>,
    /// Generated source, kept only while shader debugging
    pub source: Option<String>,
}

/// One shader variant in a cache table
#[derive(Debug)]
pub struct CacheEntry<A> {
    claimed: AtomicBool,
    compiled: AtomicBool,
    failed: AtomicBool,
    passthrough: bool,
    program: OnceLock<CompiledProgram<A>>,
}

impl<A> CacheEntry<A> {
    /// Fresh, unclaimed entry
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            compiled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            passthrough: false,
            program: OnceLock::new(),
        }
    }

    /// Entry that is already compiled (disk replay)
    pub fn precompiled(bytecode: Vec<u8>, artifact: A) -> Self {
        let entry = Self::new();
        entry.claimed.store(true, Ordering::Relaxed);
        entry.publish(CompiledProgram {
            bytecode,
            artifact: Some(artifact),
            source: None,
        });
        entry
    }

    /// Identity stage: compiled, with nothing to bind
    pub fn passthrough() -> Self {
        let mut entry = Self::new();
        entry.passthrough = true;
        entry.claimed.store(true, Ordering::Relaxed);
        entry.publish(CompiledProgram {
            bytecode: Vec::new(),
            artifact: None,
            source: None,
        });
        entry
    }

    /// Try to become the one caller responsible for compiling this entry.
    /// Exactly one caller ever gets `true`.
    pub fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Store the compiled program and make it visible to other threads.
    /// Returns false if the entry was already published.
    pub(crate) fn publish(&self, program: CompiledProgram<A>) -> bool {
        if self.program.set(program).is_err() {
            return false;
        }
        // Release pairs with the Acquire in `is_compiled`, so anyone seeing
        // `compiled` also sees the payload.
        self.compiled.store(true, Ordering::Release);
        true
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Compiled or failed; nothing more will happen to this entry
    pub fn is_settled(&self) -> bool {
        self.is_compiled() || self.is_failed()
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn state(&self) -> EntryState {
        if self.is_compiled() {
            EntryState::Compiled
        } else if self.is_failed() {
            EntryState::Failed
        } else if self.is_claimed() {
            EntryState::Claimed
        } else {
            EntryState::Unclaimed
        }
    }

    /// Compiled payload, once published
    pub fn program(&self) -> Option<&CompiledProgram<A>> {
        if self.is_compiled() {
            self.program.get()
        } else {
            None
        }
    }

    /// Bindable artifact, once compiled (`None` for passthrough)
    pub fn artifact(&self) -> Option<&A> {
        self.program().and_then(|p| p.artifact.as_ref())
    }

    pub fn bytecode(&self) -> Option<&[u8]> {
        self.program().map(|p| p.bytecode.as_slice())
    }

    /// Whether a draw can use this entry right now
    pub fn is_ready(&self) -> bool {
        self.passthrough || self.artifact().is_some()
    }
}

impl<A> Default for CacheEntry<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_one_shot() {
        let entry: CacheEntry<u32> = CacheEntry::new();
        assert_eq!(entry.state(), EntryState::Unclaimed);
        assert!(entry.try_claim());
        assert!(!entry.try_claim());
        assert_eq!(entry.state(), EntryState::Claimed);
    }

    #[test]
    fn test_publish() {
        let entry: CacheEntry<u32> = CacheEntry::new();
        assert!(entry.try_claim());
        assert!(entry.artifact().is_none());

        assert!(entry.publish(CompiledProgram {
            bytecode: vec![1, 2, 3],
            artifact: Some(7),
            source: None,
        }));
        assert_eq!(entry.state(), EntryState::Compiled);
        assert_eq!(entry.artifact(), Some(&7));
        assert_eq!(entry.bytecode(), Some(&[1u8, 2, 3][..]));
        assert!(entry.is_ready());

        // Second publish is ignored
        assert!(!entry.publish(CompiledProgram {
            bytecode: vec![9],
            artifact: Some(9),
            source: None,
        }));
        assert_eq!(entry.artifact(), Some(&7));
    }

    #[test]
    fn test_failed_entry() {
        let entry: CacheEntry<u32> = CacheEntry::new();
        entry.try_claim();
        entry.mark_failed();
        assert_eq!(entry.state(), EntryState::Failed);
        assert!(entry.is_settled());
        assert!(!entry.is_compiled());
        assert!(!entry.is_ready());
    }

    #[test]
    fn test_passthrough_entry() {
        let entry: CacheEntry<u32> = CacheEntry::passthrough();
        assert!(entry.is_compiled());
        assert!(entry.is_passthrough());
        assert!(entry.is_ready());
        assert!(entry.artifact().is_none());
        assert!(!entry.try_claim());
    }

    #[test]
    fn test_precompiled_entry() {
        let entry = CacheEntry::precompiled(vec![0xAA], 3u32);
        assert!(entry.is_compiled());
        assert!(!entry.try_claim());
        assert_eq!(entry.artifact(), Some(&3));
    }
}
