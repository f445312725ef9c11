//! Content+mtime identity for a filesystem path.
//!
//! A [`Fingerprint`] is the unit of staleness detection for the whole engine:
//! every file that participates in a task's cache key (its declared inputs
//! and outputs) is reduced to one of these, and a cache hit requires every
//! fingerprint recorded at the previous run to still [`Fingerprint::check`]
//! against the file on disk.

use std::time::SystemTime;

use color_eyre::{Result, eyre::Context as _};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{fs, path::AbsFilePath};

/// Content identity for a single file: the mtime observed when the
/// fingerprint was created, plus a SHA-256 over the full file content.
///
/// The mtime is an inexpensive first check; filesystems reliably bump it on
/// any write, so under ordinary conditions comparing it alone is sufficient
/// to prove a file unchanged. The hash exists to absorb the cases where mtime
/// comparison alone would lie: `touch`, restoring from a backup, or two
/// writes landing in the same mtime tick.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Fingerprint {
    mtime_ns: i64,
    hash: [u8; 32],
}

impl Fingerprint {
    /// Observe the file at `path` and record its current mtime and content
    /// hash.
    ///
    /// Fails if the file does not exist or cannot be read.
    #[instrument(name = "Fingerprint::create")]
    pub async fn create(path: &AbsFilePath) -> Result<Self> {
        let metadata = fs::metadata(path.as_std_path())
            .await
            .context("stat file")?
            .ok_or_else(|| color_eyre::eyre::eyre!("file does not exist: {path:?}"))?;
        let mtime_ns = mtime_ns(metadata.modified().context("read mtime")?);
        let hash = fs::hash_file(path).await.context("hash file")?;
        trace!(?path, mtime_ns, hash = %hex::encode(hash), "created fingerprint");
        Ok(Self { mtime_ns, hash })
    }

    /// Check whether the file at `path` still matches this fingerprint.
    ///
    /// Returns `false` if the path does not exist. Otherwise, returns `true`
    /// if the current mtime matches the recorded one (the fast path, which
    /// avoids hashing); if it doesn't, falls back to rehashing the file and
    /// comparing against the recorded hash.
    #[instrument(name = "Fingerprint::check")]
    pub async fn check(&self, path: &AbsFilePath) -> Result<bool> {
        let Some(metadata) = fs::metadata(path.as_std_path())
            .await
            .context("stat file")?
        else {
            trace!(?path, "fingerprint check: file missing");
            return Ok(false);
        };

        let current_mtime_ns = mtime_ns(metadata.modified().context("read mtime")?);
        if current_mtime_ns == self.mtime_ns {
            trace!(?path, "fingerprint check: mtime match");
            return Ok(true);
        }

        let current_hash = fs::hash_file(path).await.context("hash file")?;
        let matches = current_hash == self.hash;
        trace!(?path, matches, "fingerprint check: mtime differs, compared hash");
        Ok(matches)
    }
}

fn mtime_ns(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos() as i64,
        // A file with an mtime before the epoch (rare, but filesystems allow
        // it) still needs a total order; negate the magnitude rather than
        // fail outright.
        Err(err) => -(err.duration().as_nanos() as i64),
    }
}
