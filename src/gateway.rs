use super::account::UserStore;
use super::bank::BankError;
use super::common::{Cents, JobId};
use super::store::TransactionStore;
use super::transaction::Request;
use super::worker::{FailReason, Job, Outcome, WorkerPool};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::JoinHandle;

/// Hard cap on operations a single user may have admitted at once: the one
/// running plus everything queued behind it.
const MAX_PENDING: u32 = 10;

/// What a blocked caller gets back through its waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Balance(Cents),
    Transfer { sender: Cents, receiver: Cents },
}

/// One-shot reply handle for a blocked caller. The gateway writes exactly
/// once and drops it; a caller that went away makes the send a no-op.
pub type Waiter = SyncSender<Result<Reply, BankError>>;

/// Everything the coordinator reacts to, on a single queue: client
/// submissions, worker completions and its own advance ticks.
pub enum Event {
    Submit(Request, Waiter),
    Done(Outcome),
    Advance(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotStatus {
    /// No operation of this user is running.
    Idle,
    /// One operation of this user is executing or being answered inline.
    Running,
    /// The queue head is a transfer parked until `on` can be locked.
    Waiting { on: String },
}

/// Per-user admission bookkeeping.
///
/// `pending` counts the queue plus the running operation and never exceeds
/// [`MAX_PENDING`]. `inbound` marks the user as the locked receiver of a
/// transfer in flight; that lock deliberately does not consume a `pending`
/// unit, so a popular receiver cannot be starved by inbound traffic.
#[derive(Debug)]
struct Slot {
    status: SlotStatus,
    inbound: bool,
    pending: u32,
    queue: VecDeque<(Request, Waiter)>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            status: SlotStatus::Idle,
            inbound: false,
            pending: 0,
            queue: VecDeque::new(),
        }
    }
}

impl Slot {
    /// Occupied slots admit new work only through the queue.
    fn occupied(&self) -> bool {
        self.inbound || self.status != SlotStatus::Idle
    }

    /// A transfer may lock this user as its receiver: nothing of the user's
    /// own is running and no other transfer holds it. A parked sender
    /// qualifies; its own head stays frozen while the lock is held.
    fn lockable(&self) -> bool {
        !self.inbound && self.status != SlotStatus::Running
    }

    fn empty(&self) -> bool {
        !self.occupied() && self.pending == 0 && self.queue.is_empty()
    }
}

/// Start the coordinator loop and its worker pool. The returned sender is
/// the only way in; send [`Event::Shutdown`] to stop the loop.
pub fn spawn(
    store: UserStore,
    log: TransactionStore,
    n_workers: usize,
) -> (Sender<Event>, JoinHandle<()>) {
    let (events, inbox) = mpsc::channel();
    let pool = WorkerPool::new(n_workers, store.clone(), log, events.clone());
    let gateway = Gateway::new(store, pool, events.clone());
    let handle = std::thread::spawn(move || gateway.run(inbox));
    (events, handle)
}

/// The admission coordinator.
///
/// All slot state lives on this single thread, which is what makes the
/// admission decisions atomic: a transfer locks both endpoints in one event,
/// or neither. Workers run concurrently but never touch slot state; they
/// report back through the event queue.
struct Gateway {
    users: HashMap<String, Slot>,
    inflight: HashMap<JobId, Waiter>,
    /// Senders parked in `Waiting` state, keyed by the receiver they need.
    parked: HashMap<String, Vec<String>>,
    store: UserStore,
    pool: WorkerPool,
    events: Sender<Event>,
    next_job: JobId,
}

impl Gateway {
    fn new(store: UserStore, pool: WorkerPool, events: Sender<Event>) -> Self {
        Self {
            users: HashMap::new(),
            inflight: HashMap::new(),
            parked: HashMap::new(),
            store,
            pool,
            events,
            next_job: 0,
        }
    }

    fn run(mut self, inbox: Receiver<Event>) {
        while let Ok(event) = inbox.recv() {
            if !self.handle(event) {
                break;
            }
        }
        self.pool.join();
    }

    /// Process one event to completion. Returns `false` on shutdown.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Submit(req, waiter) => self.submit(req, waiter),
            Event::Done(outcome) => self.complete(outcome),
            Event::Advance(user) => self.advance(&user),
            Event::Shutdown => return false,
        }
        true
    }

    fn submit(&mut self, req: Request, waiter: Waiter) {
        if let Request::Send { .. } = req {
            self.submit_send(req, waiter)
        } else {
            self.submit_single(req, waiter)
        }
    }

    fn submit_single(&mut self, req: Request, waiter: Waiter) {
        let name = req.initiator().to_owned();
        {
            let slot = self.users.entry(name.clone()).or_default();
            if slot.occupied() {
                if slot.pending >= MAX_PENDING {
                    let _ = waiter.send(Err(BankError::TooManyRequestsToUser));
                } else {
                    slot.pending += 1;
                    slot.queue.push_back((req, waiter));
                }
                return;
            }
        }
        if !self.store.contains(&name) {
            // nothing was admitted; forget the untouched slot
            self.remove_if_empty(&name);
            let _ = waiter.send(Err(BankError::UserDoesNotExist));
            return;
        }
        if let Some(slot) = self.users.get_mut(&name) {
            slot.status = SlotStatus::Running;
            slot.pending += 1;
        }
        self.start_single(req, waiter);
    }

    fn submit_send(&mut self, req: Request, waiter: Waiter) {
        let (from, to) = {
            let Request::Send { from, to, .. } = &req else {
                return;
            };
            (from.clone(), to.clone())
        };
        debug_assert_ne!(from, to);
        {
            let sender = self.users.entry(from.clone()).or_default();
            if sender.occupied() {
                // only the sender is rate limited
                if sender.pending >= MAX_PENDING {
                    let _ = waiter.send(Err(BankError::TooManyRequestsToUser));
                } else {
                    sender.pending += 1;
                    sender.queue.push_back((req, waiter));
                }
                return;
            }
        }
        if !self.store.contains(&from) {
            self.remove_if_empty(&from);
            let _ = waiter.send(Err(BankError::SenderNotFound));
            return;
        }
        if !self.store.contains(&to) {
            self.remove_if_empty(&to);
            let _ = waiter.send(Err(BankError::ReceiverNotFound));
            return;
        }
        if let Some(sender) = self.users.get_mut(&from) {
            sender.pending += 1;
        }
        self.start_send(&from, &to, req, waiter);
    }

    /// Run a single-user operation whose slot this call already holds.
    fn start_single(&mut self, req: Request, waiter: Waiter) {
        match req {
            Request::Balance { user, currency } => {
                let reply = match self.store.get(&user) {
                    Ok(found) => Ok(Reply::Balance(found.balance(&currency))),
                    Err(_) => Err(BankError::UserDoesNotExist),
                };
                let _ = waiter.send(reply);
                self.post_advance(user);
            }
            req @ (Request::Deposit { .. } | Request::Withdraw { .. }) => {
                self.dispatch(req, waiter)
            }
            Request::Send { from, .. } => {
                // transfers are started by start_send
                tracing::error!(%from, "transfer routed as a single-user operation");
                let _ = waiter.send(Err(BankError::Unexpected));
                self.post_advance(from);
            }
        }
    }

    /// Run or park a transfer whose sender slot this call already holds.
    fn start_send(&mut self, from: &str, to: &str, req: Request, waiter: Waiter) {
        let receiver_free = self.users.entry(to.to_owned()).or_default().lockable();
        if !receiver_free {
            // the transfer keeps its place at the head of the sender's
            // queue and retries once the receiver frees up
            if let Some(sender) = self.users.get_mut(from) {
                sender.status = SlotStatus::Waiting { on: to.to_owned() };
                sender.queue.push_front((req, waiter));
            }
            let parked = self.parked.entry(to.to_owned()).or_default();
            if !parked.iter().any(|name| name == from) {
                parked.push(from.to_owned());
            }
            // a waiting sender has nothing running, so transfers aimed at
            // it may now proceed
            self.wake_parked(from);
            return;
        }
        if let Some(receiver) = self.users.get_mut(to) {
            receiver.inbound = true;
        }
        if let Some(sender) = self.users.get_mut(from) {
            sender.status = SlotStatus::Running;
        }
        self.dispatch(req, waiter);
    }

    /// Pop the next queued operation for `name` and try to run it. Lookup
    /// misses are replied here and the slot advances again through the event
    /// queue, never by recursion.
    fn start_head(&mut self, name: &str) {
        let Some((req, waiter)) = self
            .users
            .get_mut(name)
            .and_then(|slot| slot.queue.pop_front())
        else {
            return;
        };
        match &req {
            Request::Send { from, to, .. } => {
                let (from, to) = (from.clone(), to.clone());
                if !self.store.contains(&from) {
                    self.hold(&from);
                    let _ = waiter.send(Err(BankError::SenderNotFound));
                    self.post_advance(from);
                    return;
                }
                if !self.store.contains(&to) {
                    self.hold(&from);
                    let _ = waiter.send(Err(BankError::ReceiverNotFound));
                    self.post_advance(from);
                    return;
                }
                self.start_send(&from, &to, req, waiter);
            }
            _ => {
                if !self.store.contains(name) {
                    self.hold(name);
                    let _ = waiter.send(Err(BankError::UserDoesNotExist));
                    self.post_advance(name.to_owned());
                    return;
                }
                self.hold(name);
                self.start_single(req, waiter);
            }
        }
    }

    /// Keep `name` locked through a synchronous step; the paired advance is
    /// already on its way.
    fn hold(&mut self, name: &str) {
        if let Some(slot) = self.users.get_mut(name) {
            slot.status = SlotStatus::Running;
        }
    }

    fn dispatch(&mut self, req: Request, waiter: Waiter) {
        let job = self.next_job;
        self.next_job += 1;
        let involved = involved_users(&req);
        self.inflight.insert(job, waiter);
        if let Err(err) = self.pool.dispatch(Job { id: job, req }) {
            tracing::error!(%err, job, "worker pool rejected a job");
            if let Some(waiter) = self.inflight.remove(&job) {
                let _ = waiter.send(Err(BankError::Unexpected));
            }
            for user in involved {
                self.post_advance(user);
            }
        }
    }

    fn complete(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Finished {
                job,
                sender,
                receiver,
                ..
            } => {
                match self.inflight.remove(&job) {
                    Some(waiter) => {
                        let reply = match &receiver {
                            Some((_, credited)) => Reply::Transfer {
                                sender: sender.1,
                                receiver: *credited,
                            },
                            None => Reply::Balance(sender.1),
                        };
                        let _ = waiter.send(Ok(reply));
                    }
                    None => tracing::warn!(job, "completion for unknown job"),
                }
                self.post_advance(sender.0);
                if let Some((to, _)) = receiver {
                    self.post_advance(to);
                }
            }
            Outcome::Failed { job, reason, users } => {
                match self.inflight.remove(&job) {
                    Some(waiter) => {
                        let error = match reason {
                            FailReason::NotEnoughFunds => BankError::NotEnoughFunds,
                            _ => BankError::Unexpected,
                        };
                        let _ = waiter.send(Err(error));
                    }
                    None => tracing::warn!(job, "failure report for unknown job"),
                }
                for user in users {
                    self.post_advance(user);
                }
            }
        }
    }

    /// An operation involving `name` ended: release what it held and resume
    /// whatever queued up behind it.
    fn advance(&mut self, name: &str) {
        let Some(slot) = self.users.get_mut(name) else {
            tracing::warn!(user = name, "advance for an unknown slot");
            return;
        };
        if slot.inbound {
            // receiver side of a transfer: the lock never consumed a
            // pending unit, so releasing it is all there is to settle
            slot.inbound = false;
            if slot.status == SlotStatus::Running {
                tracing::error!(user = name, "inbound lock on a running slot");
                return;
            }
            if slot.status == SlotStatus::Idle && slot.queue.is_empty() {
                self.wake_parked(name);
            } else {
                self.start_head(name);
            }
            return;
        }
        match slot.status {
            SlotStatus::Running => {
                // the finished operation releases its admission unit
                slot.pending = slot.pending.saturating_sub(1);
                if slot.queue.is_empty() {
                    slot.status = SlotStatus::Idle;
                    slot.pending = 0;
                    self.wake_parked(name);
                } else {
                    self.start_head(name);
                }
            }
            _ => tracing::warn!(user = name, "advance for an idle slot"),
        }
    }

    /// Retry every sender parked on `name`. Senders that lose the race for
    /// the receiver simply park again.
    fn wake_parked(&mut self, name: &str) {
        let Some(waiting) = self.parked.remove(name) else {
            return;
        };
        for sender in waiting {
            let ready = self.users.get(&sender).is_some_and(|slot| {
                !slot.inbound && matches!(&slot.status, SlotStatus::Waiting { on } if on == name)
            });
            if ready {
                self.start_head(&sender);
            }
        }
    }

    fn post_advance(&self, user: String) {
        let _ = self.events.send(Event::Advance(user));
    }

    fn remove_if_empty(&mut self, name: &str) {
        if self.users.get(name).is_some_and(Slot::empty) {
            self.users.remove(name);
        }
    }
}

fn involved_users(req: &Request) -> Vec<String> {
    match req {
        Request::Send { from, to, .. } => vec![from.clone(), to.clone()],
        other => vec![other.initiator().to_owned()],
    }
}
