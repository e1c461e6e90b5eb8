use super::account::{self, UserStore};
use super::common::{Cents, JobId};
use super::gateway::Event;
use super::store::{self, Patch, TransactionStore};
use super::transaction::{
    Direction, FailCause, OpStatus, Operation, Request, Transaction, TxKind, TxStatus,
};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::JoinHandle;
use thiserror::Error;
use uuid::Uuid;

const BUF_SIZE: usize = 100;

/// One admitted money movement, handed to the pool by the gateway.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub req: Request,
}

/// Terminal report a worker publishes for a job. The failure arm names every
/// user the gateway locked for the job, so each of them can be released.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Finished {
        job: JobId,
        kind: TxKind,
        sender: (String, Cents),
        receiver: Option<(String, Cents)>,
    },
    Failed {
        job: JobId,
        reason: FailReason,
        users: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    NotEnoughFunds,
    UserDoesNotExist,
    BalanceWrite,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("worker gone")]
    Disconnected(#[from] mpsc::SendError<Job>),
}

/// Fixed set of executors for admitted jobs.
///
/// Jobs shard by the initiating user, so one user's movements are processed
/// by one worker in dispatch order. Exclusivity does not depend on that: the
/// gateway never has two jobs for the same user in flight.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

struct WorkerHandle {
    jobs: SyncSender<Job>,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spin up `n_workers` executors sharing one completion channel.
    pub fn new(
        n_workers: usize,
        users: UserStore,
        log: TransactionStore,
        completions: Sender<Event>,
    ) -> Self {
        let workers = (0..n_workers.max(1))
            .map(|_| {
                let (worker, jobs) = Worker::new(users.clone(), log.clone(), completions.clone());
                WorkerHandle {
                    jobs,
                    handle: worker.run(),
                }
            })
            .collect();
        Self { workers }
    }

    pub fn dispatch(&self, job: Job) -> Result<(), Error> {
        let shard = shard_index(job.req.initiator(), self.workers.len());
        Ok(self.workers[shard].jobs.send(job)?)
    }

    /// Let every worker drain its queue and exit.
    pub fn join(self) {
        for WorkerHandle { jobs, handle } in self.workers {
            drop(jobs);
            let _ = handle.join();
        }
    }
}

fn shard_index(user: &str, n_workers: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user.hash(&mut hasher);
    (hasher.finish() % n_workers as u64) as usize
}

struct Worker {
    jobs: Receiver<Job>,
    users: UserStore,
    log: TransactionStore,
    completions: Sender<Event>,
}

#[derive(Error, Debug)]
enum ApplyError {
    #[error(transparent)]
    User(#[from] account::Error),
    #[error(transparent)]
    Log(#[from] store::Error),
    #[error("balance out of range")]
    Overflow,
}

impl Worker {
    fn new(
        users: UserStore,
        log: TransactionStore,
        completions: Sender<Event>,
    ) -> (Self, SyncSender<Job>) {
        let (tx, rx) = mpsc::sync_channel(BUF_SIZE);
        (
            Self {
                jobs: rx,
                users,
                log,
                completions,
            },
            tx,
        )
    }

    fn run(self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            // recv() only fails on disconnection
            while let Ok(job) = self.jobs.recv() {
                let outcome = self.process(job);
                // the coordinator going away mid-shutdown is the only
                // reason this send can fail
                let _ = self.completions.send(Event::Done(outcome));
            }
        })
    }

    fn process(&self, job: Job) -> Outcome {
        let Job { id, req } = job;
        match req {
            Request::Deposit {
                user,
                currency,
                amount,
            } => self.deposit(id, user, currency, amount),
            Request::Withdraw {
                user,
                currency,
                amount,
            } => self.withdraw(id, user, currency, amount),
            Request::Send {
                from,
                to,
                currency,
                amount,
            } => self.send(id, from, to, currency, amount),
            Request::Balance { user, .. } => {
                tracing::error!(%user, "balance read reached a worker");
                Outcome::Failed {
                    job: id,
                    reason: FailReason::BalanceWrite,
                    users: vec![user],
                }
            }
        }
    }

    fn deposit(&self, job: JobId, user: String, currency: String, amount: Cents) -> Outcome {
        let mut tx = match self.open(job, TxKind::Deposit) {
            Ok(tx) => tx,
            Err(err) => return self.unrecorded(job, err, vec![user]),
        };
        match self.apply(&mut tx, Direction::Credit, &user, &currency, amount) {
            Ok(balance) => {
                self.finish(&mut tx);
                Outcome::Finished {
                    job,
                    kind: TxKind::Deposit,
                    sender: (user, balance),
                    receiver: None,
                }
            }
            Err(err) => self.fail(tx, err, vec![user]),
        }
    }

    fn withdraw(&self, job: JobId, user: String, currency: String, amount: Cents) -> Outcome {
        let current = match self.users.get(&user) {
            Ok(current) => current,
            // the gateway verified existence at admission
            Err(_) => {
                return Outcome::Failed {
                    job,
                    reason: FailReason::UserDoesNotExist,
                    users: vec![user],
                }
            }
        };
        if current.balance(&currency) < amount {
            // rejected before any record exists
            return Outcome::Failed {
                job,
                reason: FailReason::NotEnoughFunds,
                users: vec![user],
            };
        }
        let mut tx = match self.open(job, TxKind::Withdraw) {
            Ok(tx) => tx,
            Err(err) => return self.unrecorded(job, err, vec![user]),
        };
        match self.apply(&mut tx, Direction::Debit, &user, &currency, amount) {
            Ok(balance) => {
                self.finish(&mut tx);
                Outcome::Finished {
                    job,
                    kind: TxKind::Withdraw,
                    sender: (user, balance),
                    receiver: None,
                }
            }
            Err(err) => self.fail(tx, err, vec![user]),
        }
    }

    fn send(
        &self,
        job: JobId,
        from: String,
        to: String,
        currency: String,
        amount: Cents,
    ) -> Outcome {
        let users = vec![from.clone(), to.clone()];
        let sender = match self.users.get(&from) {
            Ok(sender) => sender,
            Err(_) => {
                return Outcome::Failed {
                    job,
                    reason: FailReason::UserDoesNotExist,
                    users,
                }
            }
        };
        if self.users.get(&to).is_err() {
            return Outcome::Failed {
                job,
                reason: FailReason::UserDoesNotExist,
                users,
            };
        }
        if sender.balance(&currency) < amount {
            return Outcome::Failed {
                job,
                reason: FailReason::NotEnoughFunds,
                users,
            };
        }
        let mut tx = match self.open(job, TxKind::Send) {
            Ok(tx) => tx,
            Err(err) => return self.unrecorded(job, err, users),
        };
        let debited = match self.apply(&mut tx, Direction::Debit, &from, &currency, amount) {
            Ok(debited) => debited,
            Err(err) => return self.fail(tx, err, users),
        };
        match self.apply(&mut tx, Direction::Credit, &to, &currency, amount) {
            Ok(credited) => {
                self.finish(&mut tx);
                Outcome::Finished {
                    job,
                    kind: TxKind::Send,
                    sender: (from, debited),
                    receiver: Some((to, credited)),
                }
            }
            Err(err) => self.fail(tx, err, users),
        }
    }

    /// Record a fresh in-progress transaction for `job`.
    fn open(&self, job: JobId, kind: TxKind) -> Result<Transaction, store::Error> {
        let tx = Transaction {
            id: Uuid::new_v4(),
            kind,
            operations: Vec::new(),
            status: TxStatus::InProgress,
            worker: job,
        };
        self.log.create(&tx)?;
        Ok(tx)
    }

    fn unrecorded(&self, job: JobId, err: store::Error, users: Vec<String>) -> Outcome {
        tracing::error!(%err, job, "could not record transaction");
        Outcome::Failed {
            job,
            reason: FailReason::BalanceWrite,
            users,
        }
    }

    /// Mutate one balance and record the leg. The store write happens before
    /// the log append, so a recorded operation always reflects an applied
    /// balance.
    fn apply(
        &self,
        tx: &mut Transaction,
        direction: Direction,
        username: &str,
        currency: &str,
        amount: Cents,
    ) -> Result<Cents, ApplyError> {
        let user = self.users.get(username)?;
        let post = user
            .balance(currency)
            .checked_add(direction.signed(amount))
            .ok_or(ApplyError::Overflow)?;
        let mut balances = user.balances;
        balances.insert(currency.to_owned(), post);
        self.users.update(username, balances)?;
        tx.operations.push(Operation {
            direction,
            username: username.to_owned(),
            currency: currency.to_owned(),
            amount,
            post_balance: post,
            status: OpStatus::Finished,
        });
        self.log.update(
            tx.id,
            Patch {
                operations: Some(tx.operations.clone()),
                ..Patch::default()
            },
        )?;
        Ok(post)
    }

    fn finish(&self, tx: &mut Transaction) {
        tx.status = TxStatus::Finished;
        if let Err(err) = self.log.update(
            tx.id,
            Patch {
                status: Some(TxStatus::Finished),
                ..Patch::default()
            },
        ) {
            tracing::error!(%err, tx = %tx.id, "could not mark transaction finished");
        }
    }

    /// Roll back every applied leg of a partially executed transaction, then
    /// report the failure.
    fn fail(&self, mut tx: Transaction, err: ApplyError, users: Vec<String>) -> Outcome {
        tracing::warn!(%err, tx = %tx.id, "transaction failed, reverting");
        for op in tx.operations.iter_mut().rev() {
            if op.status != OpStatus::Finished {
                continue;
            }
            match self.unapply(op) {
                Ok(()) => op.status = OpStatus::Reverted,
                // the discrepancy survives; nothing safe is left to do here
                Err(err) => tracing::error!(%err, user = %op.username, "revert failed"),
            }
        }
        tx.status = TxStatus::FailedReverted(FailCause::BalanceWrite);
        if let Err(err) = self.log.update(
            tx.id,
            Patch {
                operations: Some(tx.operations.clone()),
                status: Some(tx.status.clone()),
                ..Patch::default()
            },
        ) {
            tracing::error!(%err, tx = %tx.id, "could not mark transaction reverted");
        }
        Outcome::Failed {
            job: tx.worker,
            reason: FailReason::BalanceWrite,
            users,
        }
    }

    fn unapply(&self, op: &Operation) -> Result<(), ApplyError> {
        let user = self.users.get(&op.username)?;
        let post = user
            .balance(&op.currency)
            .checked_add(op.direction.inverse().signed(op.amount))
            .ok_or(ApplyError::Overflow)?;
        let mut balances = user.balances;
        balances.insert(op.currency.clone(), post);
        self.users.update(&op.username, balances)?;
        Ok(())
    }
}
