use crate::{error::AppError, models::Initiator};

/// Namespace of a charge attempt. Scheduled and manual attempts never share keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Scheduled,
    Manual,
}

impl AttemptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub fn initiator(self) -> Initiator {
        match self {
            Self::Scheduled => Initiator::System,
            Self::Manual => Initiator::Admin,
        }
    }
}

impl From<Initiator> for AttemptKind {
    fn from(initiator: Initiator) -> Self {
        match initiator {
            Initiator::System => Self::Scheduled,
            Initiator::Admin => Self::Manual,
        }
    }
}

pub fn is_valid_period(period: &str) -> bool {
    period.len() == 6 && period.bytes().all(|byte| byte.is_ascii_digit())
}

/// Gateway idempotency key for one logical charge attempt.
pub fn idempotency_key(
    lease_id: &str,
    period: &str,
    kind: AttemptKind,
    attempt_no: i64,
) -> Result<String, AppError> {
    let lease_id = lease_id.trim();
    if lease_id.is_empty() {
        return Err(AppError::InvalidArgument(
            "lease id is required for an idempotency key.".to_string(),
        ));
    }
    if !is_valid_period(period) {
        return Err(AppError::InvalidArgument(format!(
            "period '{period}' must be exactly six digits (YYYYMM)."
        )));
    }
    let attempt_no = attempt_no.max(1);
    Ok(format!(
        "lease:{lease_id}:{period}:{}:{attempt_no}",
        kind.as_str()
    ))
}
