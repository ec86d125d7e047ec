use super::ids::{CorrelationToken, LineItemId, TransferId};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    InFlight,
    Succeeded,
    Failed,
}

/// Final word on one outbound transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferOutcome {
    Succeeded {
        transaction_id: String,
    },
    Failed {
        code: String,
        description: String,
    },
}

/// One attempt to pay a commission line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTransfer {
    pub id: TransferId,
    pub line_item: LineItemId,
    pub attempt: u32,
    pub correlation: CorrelationToken,
    pub conversation_id: Option<String>,
    pub status: TransferStatus,
    pub transaction_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboundTransfer {
    pub fn start(
        line_item: LineItemId,
        attempt: u32,
        correlation: CorrelationToken,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransferId::new(),
            line_item,
            attempt,
            correlation,
            conversation_id: None,
            status: TransferStatus::InFlight,
            transaction_id: None,
            failure_code: None,
            failure_description: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn settle(&self, outcome: TransferOutcome, at: DateTime<Utc>) -> Result<Self, PaymentError> {
        if self.status != TransferStatus::InFlight {
            return Err(PaymentError::InvalidTransition(format!(
                "transfer {} (attempt {}) already settled as {:?}",
                self.correlation, self.attempt, self.status
            )));
        }
        let mut next = self.clone();
        next.completed_at = Some(at);
        match outcome {
            TransferOutcome::Succeeded { transaction_id } => {
                next.status = TransferStatus::Succeeded;
                next.transaction_id = Some(transaction_id);
            }
            TransferOutcome::Failed { code, description } => {
                next.status = TransferStatus::Failed;
                next.failure_code = Some(code);
                next.failure_description = Some(description);
            }
        }
        Ok(next)
    }
}
