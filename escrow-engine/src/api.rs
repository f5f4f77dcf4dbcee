//! Transport-agnostic response envelopes
//!
//! Every response carries `success`; failures add an `error` object with a
//! stable machine-readable code. Payload fields are flattened next to
//! `success`, so an approval serializes as
//! `{"success": true, "mzkey": "...", "expiresAt": "..."}`.

use crate::{
    EscrowResult,
    error::EscrowError,
    fraud_monitor::MonitorOutcome,
    models::TaskStatus,
    task_manager::{ApprovalReceipt, BalanceCheck, ClaimReceipt},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Structured error carried by failed responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Caller may retry the same request
    pub transient: bool,
}

impl From<&EscrowError> for ErrorBody {
    fn from(err: &EscrowError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &EscrowError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

impl<T, U> From<EscrowResult<U>> for ApiResponse<T>
where
    T: From<U>,
{
    fn from(result: EscrowResult<U>) -> Self {
        match result {
            Ok(value) => Self::ok(T::from(value)),
            Err(e) => Self::err(&e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    pub mzkey: String,
    pub expires_at: DateTime<Utc>,
}

impl From<ApprovalReceipt> for ApproveResponse {
    fn from(receipt: ApprovalReceipt) -> Self {
        Self {
            mzkey: receipt.mzkey,
            expires_at: receipt.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub seed_phrase: String,
    pub wallet_address: String,
    pub amount: Decimal,
}

impl From<ClaimReceipt> for ClaimResponse {
    fn from(receipt: ClaimReceipt) -> Self {
        Self {
            seed_phrase: receipt.seed_phrase,
            wallet_address: receipt.wallet_address,
            amount: receipt.amount,
        }
    }
}

/// Monitor pass result. A detected fraud is a successful pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorResponse {
    pub fraud_detected: bool,
    /// Balance in KAS, absent when the task was already terminal
    pub current_balance: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_status: Option<TaskStatus>,
}

impl From<MonitorOutcome> for MonitorResponse {
    fn from(outcome: MonitorOutcome) -> Self {
        let skipped_status = match outcome.check {
            BalanceCheck::Skipped(status) => Some(status),
            _ => None,
        };

        Self {
            fraud_detected: outcome.fraud_detected(),
            current_balance: outcome.current_balance,
            skipped_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_approve_envelope_shape() {
        let expires_at = Utc::now();
        let response: ApiResponse<ApproveResponse> = Ok::<_, EscrowError>(ApprovalReceipt {
            task_id: Uuid::new_v4(),
            mzkey: "mzkey_abc".to_string(),
            expires_at,
        })
        .into();

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["mzkey"], json!("mzkey_abc"));
        assert!(value.get("expiresAt").is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_claim_envelope_shape() {
        let response: ApiResponse<ClaimResponse> = Ok::<_, EscrowError>(ClaimReceipt {
            task_id: Uuid::new_v4(),
            seed_phrase: "word ".repeat(12).trim_end().to_string(),
            wallet_address: "kaspa:qburner".to_string(),
            amount: Decimal::new(25, 1),
        })
        .into();

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["walletAddress"], json!("kaspa:qburner"));
        assert!(value["seedPhrase"].as_str().unwrap().starts_with("word"));
        assert_eq!(value["amount"], json!("2.5"));
    }

    #[test]
    fn test_error_envelope() {
        let err = EscrowError::insufficient_funds("10", "3");
        let response: ApiResponse<ApproveResponse> = Err::<ApprovalReceipt, _>(err).into();

        assert!(!response.success);
        assert_eq!(response.error_code(), Some("insufficient_funds"));

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!("insufficient_funds"));
        assert_eq!(value["error"]["transient"], json!(false));
        assert!(value.get("mzkey").is_none());
    }

    #[test]
    fn test_monitor_envelope() {
        let response = ApiResponse::<MonitorResponse>::ok(
            MonitorOutcome {
                task_id: Uuid::new_v4(),
                check: BalanceCheck::FraudDetected,
                current_balance: Some(Decimal::ZERO),
            }
            .into(),
        );

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["fraud_detected"], json!(true));
        assert_eq!(value["current_balance"], json!("0"));
        assert!(value.get("skipped_status").is_none());
    }

    #[test]
    fn test_transient_error_flag() {
        let response = ApiResponse::<MonitorResponse>::err(&EscrowError::gateway_timeout("slow"));
        assert!(response.error.unwrap().transient);
    }
}
