use super::common::{Cents, JobId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A client request admitted by the gateway. Balance reads are answered
/// inside the coordinator; the other three kinds run on a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Deposit {
        user: String,
        currency: String,
        amount: Cents,
    },
    Withdraw {
        user: String,
        currency: String,
        amount: Cents,
    },
    Send {
        from: String,
        to: String,
        currency: String,
        amount: Cents,
    },
    Balance {
        user: String,
        currency: String,
    },
}

impl Request {
    /// The user whose slot admits this request: the sender for transfers.
    pub fn initiator(&self) -> &str {
        match self {
            Self::Deposit { user, .. }
            | Self::Withdraw { user, .. }
            | Self::Balance { user, .. } => user,
            Self::Send { from, .. } => from,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Deposit,
    Withdraw,
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    /// The delta this leg applies to a balance.
    pub fn signed(self, amount: Cents) -> Cents {
        match self {
            Self::Credit => amount,
            Self::Debit => -amount,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            Self::Credit => Self::Debit,
            Self::Debit => Self::Credit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Finished,
    Reverted,
}

/// One balance mutation leg. Only recorded once the user store write behind
/// it went through, so a logged operation always reflects an applied balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub direction: Direction,
    pub username: String,
    pub currency: String,
    pub amount: Cents,
    pub post_balance: Cents,
    pub status: OpStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxStatus {
    InProgress,
    Finished,
    Failed(FailCause),
    FailedReverted(FailCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailCause {
    NotEnoughFunds,
    UserDoesNotExist,
    BalanceWrite,
}

/// The recorded unit of work behind a single client request: one operation
/// for deposits and withdrawals, two for transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TxKind,
    pub operations: Vec<Operation>,
    pub status: TxStatus,
    pub worker: JobId,
}
