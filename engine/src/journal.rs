//! Journal commit policy for transactional destinations.
//!
//! Save filesystems buffer uncommitted writes in a bounded journal. The
//! controller tracks bytes written since the last commit and tells the copy
//! engine when to close, commit, reopen and seek before the bound is hit.

use std::fmt;
use std::sync::Arc;

use crate::device::SaveDevice;
use crate::error::EngineError;

/// Bytes kept free below the journal limit to absorb one more buffer.
pub const SAFETY_MARGIN: u64 = 0x100000;

/// Smallest active limit. With a limit of 1 no write fits below it.
pub const MIN_JOURNAL_LIMIT: u64 = 2;

/// A journal limit paired with the device that owns the journaled root.
#[derive(Clone)]
pub struct Journal {
    limit: u64,
    device: Arc<dyn SaveDevice>,
}

impl Journal {
    /// `limit == 0` disables commits for transfers using this journal.
    ///
    /// # Errors
    /// Returns EngineError::Config for a limit of 1
    pub fn new(limit: u64, device: Arc<dyn SaveDevice>) -> Result<Self, EngineError> {
        check_limit(limit)?;
        Ok(Journal { limit, device })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn device(&self) -> &dyn SaveDevice {
        self.device.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Same device, different limit.
    pub fn with_limit(&self, limit: u64) -> Result<Self, EngineError> {
        check_limit(limit)?;
        Ok(Journal {
            limit,
            device: Arc::clone(&self.device),
        })
    }

    /// Fresh per-file controller for this journal.
    pub fn controller(&self) -> JournalController {
        JournalController::new(self.limit)
    }
}

fn check_limit(limit: u64) -> Result<(), EngineError> {
    if limit != 0 && limit < MIN_JOURNAL_LIMIT {
        return Err(EngineError::Config(format!(
            "journal limit {} is below the minimum of {}",
            limit, MIN_JOURNAL_LIMIT
        )));
    }
    Ok(())
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("limit", &self.limit)
            .field("device", &self.device.name())
            .finish()
    }
}

/// Running counter and threshold for one file transfer.
///
/// `written_since_commit` never reaches `limit`: payloads are split into
/// chunks no larger than the threshold and a commit happens before any
/// chunk that would cross it.
#[derive(Debug, Clone)]
pub struct JournalController {
    written_since_commit: u64,
    limit: u64,
    threshold: u64,
    peak: u64,
}

impl JournalController {
    pub fn new(limit: u64) -> Self {
        let threshold = if limit > 2 * SAFETY_MARGIN {
            limit - SAFETY_MARGIN
        } else {
            (limit / 2).max(1)
        };
        JournalController {
            written_since_commit: 0,
            limit,
            threshold,
            peak: 0,
        }
    }

    /// A zero limit means the destination is not transactional.
    pub fn is_active(&self) -> bool {
        self.limit > 0
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn written_since_commit(&self) -> u64 {
        self.written_since_commit
    }

    /// Highest value the counter reached during this transfer.
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Largest write the consumer may issue in one call.
    pub fn max_chunk(&self) -> usize {
        if self.is_active() {
            usize::try_from(self.threshold).unwrap_or(usize::MAX)
        } else {
            usize::MAX
        }
    }

    /// True if `pending` more bytes must not be written before a commit.
    pub fn needs_commit(&self, pending: u64) -> bool {
        self.is_active()
            && self.written_since_commit > 0
            && self.written_since_commit + pending >= self.threshold
    }

    /// Record a successful write.
    pub fn accumulate(&mut self, bytes_written: u64) {
        if !self.is_active() {
            return;
        }
        self.written_since_commit += bytes_written;
        self.peak = self.peak.max(self.written_since_commit);
    }

    /// The device was committed; the journal is empty again.
    pub fn committed(&mut self) {
        self.written_since_commit = 0;
    }
}
