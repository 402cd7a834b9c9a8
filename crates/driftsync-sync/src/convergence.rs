//! Convergence verification between two digest logs.
//!
//! Two devices have converged when their current snapshots are equal, which
//! is the same as their recomputed digests being equal. When they differ,
//! the result says which side is ahead for each device.

use driftsync_core::{DeviceId, StateSnapshot};
use driftsync_store::DigestLog;

use crate::error::Result;

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both logs hold identical state.
    Converged,
    /// The logs differ (more sync rounds may be needed).
    NotConverged {
        /// Devices where the local log has the higher sequence.
        local_ahead: Vec<(DeviceId, u64, u64)>,
        /// Devices where the remote log has the higher sequence.
        remote_ahead: Vec<(DeviceId, u64, u64)>,
    },
}

impl ConvergenceResult {
    /// Check if the logs have converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare two snapshots device by device.
///
/// Each tuple is `(device, local_seq, remote_seq)`.
pub fn compare_snapshots(local: &StateSnapshot, remote: &StateSnapshot) -> ConvergenceResult {
    if local == remote {
        return ConvergenceResult::Converged;
    }

    let mut local_ahead = Vec::new();
    let mut remote_ahead = Vec::new();

    for record in local.diff(remote, true) {
        let local_seq = record.old_seq.unwrap_or(0);
        let entry = (record.device, local_seq, record.seq);
        if local_seq > record.seq {
            local_ahead.push(entry);
        } else {
            remote_ahead.push(entry);
        }
    }

    ConvergenceResult::NotConverged {
        local_ahead,
        remote_ahead,
    }
}

/// Verify two digest logs have converged.
pub async fn verify_convergence<A, B>(local: &A, remote: &B) -> Result<ConvergenceResult>
where
    A: DigestLog + ?Sized,
    B: DigestLog + ?Sized,
{
    let local_state = local.current_state().await?;
    let remote_state = remote.current_state().await?;
    Ok(compare_snapshots(&local_state, &remote_state))
}
