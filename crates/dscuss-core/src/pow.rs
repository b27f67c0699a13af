//! Proof-of-work searcher and validator.
//!
//! Finds a 64-bit nonce `N` such that
//! `leading_zero_bits(pbkdf2_hmac_sha512(der(pub) || be64(N), SALT, 1)) >= R`.

use crate::crypto::{pbkdf2_hmac_sha512, POW_SALT};
use crate::error::PowError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Probes run before yielding to the reactor.
pub const PROBES_PER_TICK: u64 = 100;

/// Probes between progress-file checkpoints.
pub const PROBES_BETWEEN_CHECKPOINTS: u64 = 1_000_000;

/// Reference runtime-check difficulty. Production deployments target ≈ 25
/// leading zero bits; this crate leaves the choice to the caller.
pub const DEFAULT_REQUIRED_ZERO_BITS: u32 = 10;

static SEARCH_RUNNING: AtomicBool = AtomicBool::new(false);

/// Held for the lifetime of a search; only one may exist process-wide.
/// Dropping it (including on early return or panic unwind) clears the
/// process-wide flag.
struct SearchGuard;

impl Drop for SearchGuard {
    fn drop(&mut self) {
        SEARCH_RUNNING.store(false, Ordering::SeqCst);
    }
}

fn acquire_guard() -> Result<SearchGuard, PowError> {
    if SEARCH_RUNNING.swap(true, Ordering::SeqCst) {
        return Err(PowError::AlreadyRunning);
    }
    Ok(SearchGuard)
}

fn pow_hash(pubkey_der: &[u8], nonce: u64) -> crate::crypto::Hash {
    let mut msg = Vec::with_capacity(pubkey_der.len() + 8);
    msg.extend_from_slice(pubkey_der);
    msg.extend_from_slice(&nonce.to_be_bytes());
    pbkdf2_hmac_sha512(&msg, POW_SALT, 1)
}

/// Recompute the hash and check the zero-count; a pure, cheap function.
pub fn validate(pubkey_der: &[u8], nonce: u64, required_zero_bits: u32) -> bool {
    pow_hash(pubkey_der, nonce).leading_zero_bits() >= required_zero_bits
}

/// A single cooperative, resumable proof-of-work search.
pub struct PowSearch {
    progress_path: PathBuf,
    pubkey_der: Vec<u8>,
    required_zero_bits: u32,
    counter: u64,
    _guard: SearchGuard,
}

impl PowSearch {
    /// Resume (or start) a search, reading the counter from `progress_path`
    /// if present. Rejects a second concurrent search in this process.
    pub fn resume(
        progress_path: impl Into<PathBuf>,
        pubkey_der: Vec<u8>,
        required_zero_bits: u32,
    ) -> Result<Self, PowError> {
        let guard = acquire_guard()?;
        let progress_path = progress_path.into();
        let counter = match std::fs::read_to_string(&progress_path) {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| PowError::CorruptProgress(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(PowError::Io(e)),
        };
        Ok(Self {
            progress_path,
            pubkey_der,
            required_zero_bits,
            counter,
            _guard: guard,
        })
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Run the search to completion, yielding to the reactor every
    /// [`PROBES_PER_TICK`] probes. On success or exhaustion the progress
    /// file is removed.
    pub async fn run(mut self) -> Result<u64, PowError> {
        loop {
            for _ in 0..PROBES_PER_TICK {
                if validate(&self.pubkey_der, self.counter, self.required_zero_bits) {
                    let _ = std::fs::remove_file(&self.progress_path);
                    return Ok(self.counter);
                }
                if self.counter == u64::MAX {
                    let _ = std::fs::remove_file(&self.progress_path);
                    return Err(PowError::Exhausted);
                }
                self.counter += 1;
            }
            if self.counter % PROBES_BETWEEN_CHECKPOINTS < PROBES_PER_TICK {
                self.checkpoint()?;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Atomically rename into place to avoid torn writes on crash.
    fn checkpoint(&self) -> Result<(), PowError> {
        let tmp_path = tmp_sibling(&self.progress_path);
        std::fs::write(&tmp_path, self.counter.to_string())?;
        std::fs::rename(&tmp_path, &self.progress_path)?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".write");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_finds_a_valid_nonce_at_low_difficulty() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("proof_of_work.tmp");
        let pubkey_der = b"fake-der-bytes".to_vec();
        let search = PowSearch::resume(&progress, pubkey_der.clone(), 4).unwrap();
        let nonce = search.run().await.unwrap();
        assert!(validate(&pubkey_der, nonce, 4));
        assert!(!progress.exists());
    }

    #[test]
    fn resume_reads_existing_counter() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("proof_of_work.tmp");
        std::fs::write(&progress, "42").unwrap();
        let search = PowSearch::resume(&progress, b"der".to_vec(), 10).unwrap();
        assert_eq!(search.counter(), 42);
    }

    #[test]
    fn resume_rejects_corrupt_progress_file() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("proof_of_work.tmp");
        std::fs::write(&progress, "not-a-number").unwrap();
        assert!(matches!(
            PowSearch::resume(&progress, b"der".to_vec(), 10),
            Err(PowError::CorruptProgress(_))
        ));
    }

    #[test]
    fn only_one_search_may_run_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("proof_of_work.tmp");
        let first = PowSearch::resume(&progress, b"der".to_vec(), 10).unwrap();
        let second = PowSearch::resume(&progress, b"der".to_vec(), 10);
        assert!(matches!(second, Err(PowError::AlreadyRunning)));
        drop(first);
        assert!(PowSearch::resume(&progress, b"der".to_vec(), 10).is_ok());
    }

    #[test]
    fn validate_is_a_pure_function() {
        let pubkey_der = b"der".to_vec();
        assert_eq!(
            validate(&pubkey_der, 7, 10),
            validate(&pubkey_der, 7, 10)
        );
    }
}
