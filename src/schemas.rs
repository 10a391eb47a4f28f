use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::InvalidArgument(format!("Validation failed: {errors}")))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetAutopayInput {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct RunAutopayInput {
    #[serde(default, alias = "batchSize")]
    #[validate(range(min = 1, max = 10000))]
    pub batch_size: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct PaymentAttemptsQuery {
    /// `YYYYMM`.
    #[validate(length(equal = 6))]
    pub period: Option<String>,
}
