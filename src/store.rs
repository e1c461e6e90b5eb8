use super::common::JobId;
use super::transaction::{Operation, Transaction, TxKind, TxStatus};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const TRANSACTIONS: TableDefinition<u128, &[u8]> = TableDefinition::new("transactions");

/// Mutable subset of a recorded transaction. The log accepts patches for
/// exactly these fields; everything else on a record is immutable once
/// created.
#[derive(Debug, Default)]
pub struct Patch {
    pub kind: Option<TxKind>,
    pub operations: Option<Vec<Operation>>,
    pub status: Option<TxStatus>,
    pub worker: Option<JobId>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("transaction id already recorded")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error(transparent)]
    Encoding(#[from] bincode::Error),
}

/// Keep a record of every transaction the workers applied.
///
/// An embedded database is heavier machinery than a volatile log strictly
/// needs, but it keeps the bookkeeping out of the workers' way and the
/// in-memory backend means nothing ever touches disk. Should the log ever be
/// replayed on restart to re-lock users with in-progress transactions, this
/// is where that would start.
#[derive(Clone)]
pub struct TransactionStore {
    db: Arc<Database>,
}

impl TransactionStore {
    pub fn new() -> Result<Self, Error> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        // materialize the table so first reads do not race first writes
        let init = db.begin_write()?;
        init.open_table(TRANSACTIONS)?;
        init.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new record. Ids are unique for the process lifetime.
    pub fn create(&self, tx: &Transaction) -> Result<(), Error> {
        let encoded = bincode::serialize(tx)?;
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TRANSACTIONS)?;
            if table.get(tx.id.as_u128())?.is_some() {
                return Err(Error::AlreadyExists);
            }
            table.insert(tx.id.as_u128(), encoded.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Transaction, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TRANSACTIONS)?;
        let guard = table.get(id.as_u128())?.ok_or(Error::NotFound)?;
        Ok(bincode::deserialize(guard.value())?)
    }

    /// Apply a field patch to an existing record.
    pub fn update(&self, id: Uuid, patch: Patch) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TRANSACTIONS)?;
            let mut tx: Transaction = {
                let guard = table.get(id.as_u128())?.ok_or(Error::NotFound)?;
                bincode::deserialize(guard.value())?
            };
            if let Some(kind) = patch.kind {
                tx.kind = kind;
            }
            if let Some(operations) = patch.operations {
                tx.operations = operations;
            }
            if let Some(status) = patch.status {
                tx.status = status;
            }
            if let Some(worker) = patch.worker {
                tx.worker = worker;
            }
            let encoded = bincode::serialize(&tx)?;
            table.insert(id.as_u128(), encoded.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn dump(&self) -> Vec<Transaction> {
        let rtx = self.db.begin_read().unwrap();
        let table = rtx.open_table(TRANSACTIONS).unwrap();
        table
            .iter()
            .unwrap()
            .map(|entry| {
                let (_, value) = entry.unwrap();
                bincode::deserialize(value.value()).unwrap()
            })
            .collect()
    }
}
