use crate::{
    error::{AppError, AppResult},
    models::{AttemptStatus, AttemptUpdate, AutopayStatus, PaymentAttempt},
    repository::{LeaseStore, LedgerStore},
};

pub const MAX_FAILURE_MESSAGE_CHARS: usize = 160;
const MAX_FAILURE_CODE_CHARS: usize = 64;
const TRUNCATION_MARKER: char = '…';

/// Statuses a row may hold for a write of `next` to be accepted.
///
/// Terminal statuses only accept themselves, which keeps late webhook
/// redeliveries idempotent without ever moving a settled row.
pub fn allowed_predecessors(next: AttemptStatus) -> &'static [AttemptStatus] {
    use AttemptStatus::*;
    match next {
        Scheduled => &[Scheduled],
        Processing => &[Scheduled, Processing],
        RequiresAction => &[Scheduled, Processing, RequiresAction],
        Succeeded => &[Scheduled, Processing, RequiresAction, Succeeded],
        Failed => &[Scheduled, Processing, RequiresAction, Failed],
        Canceled => &[Scheduled, Processing, RequiresAction, Canceled],
    }
}

pub fn can_transition(from: AttemptStatus, to: AttemptStatus) -> bool {
    allowed_predecessors(to).contains(&from)
}

/// Lease rollup implied by an attempt status. `None` leaves the rollup alone.
pub fn rollup_for(status: AttemptStatus) -> Option<AutopayStatus> {
    match status {
        AttemptStatus::Succeeded | AttemptStatus::Processing => Some(AutopayStatus::Active),
        AttemptStatus::Failed | AttemptStatus::RequiresAction => Some(AutopayStatus::Failing),
        AttemptStatus::Scheduled | AttemptStatus::Canceled => None,
    }
}

/// Trim, collapse whitespace, drop control characters and cap the length.
pub fn sanitize_failure_message(raw: &str) -> Option<String> {
    let cleaned = raw
        .chars()
        .map(|ch| if ch.is_whitespace() { ' ' } else { ch })
        .filter(|ch| !ch.is_control())
        .collect::<String>();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() <= MAX_FAILURE_MESSAGE_CHARS {
        return Some(collapsed);
    }
    let mut truncated = collapsed
        .chars()
        .take(MAX_FAILURE_MESSAGE_CHARS - 1)
        .collect::<String>()
        .trim_end()
        .to_string();
    truncated.push(TRUNCATION_MARKER);
    Some(truncated)
}

/// Failure codes are stored as short lowercase tokens.
pub fn sanitize_failure_code(raw: &str) -> String {
    let code = raw.trim().to_ascii_lowercase();
    let valid = !code.is_empty()
        && code.len() <= MAX_FAILURE_CODE_CHARS
        && code
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_');
    if valid {
        code
    } else {
        "unknown".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct TransitionResult {
    /// Row as stored after the write attempt.
    pub attempt: PaymentAttempt,
    /// False when the guard rejected the write and `attempt` is the current row.
    pub applied: bool,
    /// True only when the write moved the row to a different status. Side
    /// effects tied to a status (notifications, audit entries) key off this.
    pub changed: bool,
}

/// Guarded status write. A rejected write is not an error: the caller gets
/// the stored row back and derives everything else from its real status.
pub async fn apply_transition(
    ledger: &dyn LedgerStore,
    attempt_id: &str,
    next: AttemptStatus,
    update: &AttemptUpdate,
) -> AppResult<TransitionResult> {
    if let Some(write) = ledger
        .transition_attempt(attempt_id, next, allowed_predecessors(next), update)
        .await?
    {
        return Ok(TransitionResult {
            changed: write.previous_status != next,
            attempt: write.attempt,
            applied: true,
        });
    }

    let current = ledger
        .get_attempt(attempt_id)
        .await?
        .ok_or_else(|| AppError::NotFound("payment_attempts record not found.".to_string()))?;
    tracing::info!(
        payment_attempt_id = %attempt_id,
        current = current.status.as_str(),
        rejected = next.as_str(),
        "Payment attempt transition rejected by guard"
    );
    Ok(TransitionResult {
        attempt: current,
        applied: false,
        changed: false,
    })
}

/// Brings the lease rollup in line with an attempt status. Paused leases are
/// left alone so a late webhook cannot re-enable a lease an admin turned off.
pub async fn sync_rollup(
    leases: &dyn LeaseStore,
    lease_id: &str,
    status: AttemptStatus,
) -> AppResult<Option<AutopayStatus>> {
    let Some(target) = rollup_for(status) else {
        return Ok(None);
    };
    let Some(lease) = leases.get_lease(lease_id).await? else {
        return Ok(None);
    };
    if lease.autopay_status == AutopayStatus::Paused || lease.autopay_status == target {
        return Ok(None);
    }
    leases.set_autopay_status(lease_id, target).await?;
    Ok(Some(target))
}
