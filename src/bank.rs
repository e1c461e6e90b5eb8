use super::account::{self, UserStore};
use super::common::Cents;
use super::gateway::{self, Event, Reply};
use super::money;
use super::store::{self, TransactionStore};
use super::transaction::Request;
use rust_decimal::Decimal;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Everything an operation can fail with, as seen by a caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankError {
    #[error("wrong arguments")]
    WrongArguments,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("user does not exist")]
    UserDoesNotExist,
    #[error("sender not found")]
    SenderNotFound,
    #[error("receiver not found")]
    ReceiverNotFound,
    #[error("not enough funds")]
    NotEnoughFunds,
    #[error("too many requests to user")]
    TooManyRequestsToUser,
    #[error("unexpected failure")]
    Unexpected,
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Client handle to the banking core.
///
/// Cloning is cheap and every clone feeds the same coordinator; the core
/// shuts down when the last clone goes away. Money-moving calls block until
/// the coordinator answers.
#[derive(Clone)]
pub struct Bank {
    users: UserStore,
    events: Sender<Event>,
    _core: Arc<Core>,
}

struct Core {
    events: Sender<Event>,
    coordinator: Option<JoinHandle<()>>,
}

impl Drop for Core {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
    }
}

impl Bank {
    /// Bring up the stores, the worker pool and the coordinator.
    pub fn new(n_workers: usize) -> Result<Self, SetupError> {
        let users = UserStore::new();
        let log = TransactionStore::new()?;
        let (events, coordinator) = gateway::spawn(users.clone(), log, n_workers);
        Ok(Self {
            users,
            events: events.clone(),
            _core: Arc::new(Core {
                events,
                coordinator: Some(coordinator),
            }),
        })
    }

    /// Register a new user with empty balances. Goes straight to the user
    /// store; the gateway is not involved.
    pub fn create_user(&self, name: &str) -> Result<(), BankError> {
        if name.is_empty() {
            return Err(BankError::WrongArguments);
        }
        match self.users.create(name) {
            Ok(()) => Ok(()),
            Err(account::Error::AlreadyExists) => Err(BankError::UserAlreadyExists),
            Err(_) => Err(BankError::Unexpected),
        }
    }

    /// Credit `amount` to the user and return the new balance.
    pub fn deposit(
        &self,
        user: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<Decimal, BankError> {
        let amount = parse_amount(user, amount, currency)?;
        let reply = self.submit(Request::Deposit {
            user: user.to_owned(),
            currency: currency.to_owned(),
            amount,
        })?;
        expect_balance(reply)
    }

    /// Debit `amount` from the user and return the new balance.
    pub fn withdraw(
        &self,
        user: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<Decimal, BankError> {
        let amount = parse_amount(user, amount, currency)?;
        let reply = self.submit(Request::Withdraw {
            user: user.to_owned(),
            currency: currency.to_owned(),
            amount,
        })?;
        expect_balance(reply)
    }

    /// Move `amount` between two distinct users. Returns the sender's and
    /// the receiver's new balances, in that order.
    pub fn send(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<(Decimal, Decimal), BankError> {
        if to.is_empty() || from == to {
            return Err(BankError::WrongArguments);
        }
        let amount = parse_amount(from, amount, currency)?;
        let reply = self.submit(Request::Send {
            from: from.to_owned(),
            to: to.to_owned(),
            currency: currency.to_owned(),
            amount,
        })?;
        match reply {
            Reply::Transfer { sender, receiver } => {
                Ok((money::format(sender), money::format(receiver)))
            }
            Reply::Balance(_) => Err(BankError::Unexpected),
        }
    }

    /// Read one balance. The read is admitted like any other operation, so
    /// it observes the user between movements, never in the middle of one.
    pub fn get_balance(&self, user: &str, currency: &str) -> Result<Decimal, BankError> {
        if user.is_empty() || currency.is_empty() {
            return Err(BankError::WrongArguments);
        }
        let reply = self.submit(Request::Balance {
            user: user.to_owned(),
            currency: currency.to_owned(),
        })?;
        expect_balance(reply)
    }

    /// Hand a request to the coordinator and block until it answers.
    fn submit(&self, req: Request) -> Result<Reply, BankError> {
        let (waiter, reply) = mpsc::sync_channel(1);
        self.events
            .send(Event::Submit(req, waiter))
            .map_err(|_| BankError::Unexpected)?;
        reply.recv().map_err(|_| BankError::Unexpected)?
    }
}

fn parse_amount(user: &str, amount: Decimal, currency: &str) -> Result<Cents, BankError> {
    if user.is_empty() || currency.is_empty() || amount <= Decimal::ZERO {
        return Err(BankError::WrongArguments);
    }
    money::parse(amount).ok_or(BankError::WrongArguments)
}

fn expect_balance(reply: Reply) -> Result<Decimal, BankError> {
    match reply {
        Reply::Balance(minor) => Ok(money::format(minor)),
        Reply::Transfer { .. } => Err(BankError::Unexpected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::*;
    use std::sync::Barrier;

    fn bank() -> Bank {
        Bank::new(4).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn create_user_is_once() {
        let bank = bank();
        assert_eq!(bank.create_user("alice"), Ok(()));
        assert_eq!(bank.create_user("alice"), Err(BankError::UserAlreadyExists));
    }

    #[test]
    fn deposit_then_read_balance() {
        let bank = bank();
        bank.create_user("alice").unwrap();
        assert_eq!(bank.deposit("alice", dec("32.98"), "usd"), Ok(dec("32.98")));
        assert_eq!(bank.get_balance("alice", "usd"), Ok(dec("32.98")));
    }

    #[test]
    fn send_between_users() {
        let bank = bank();
        bank.create_user("bob").unwrap();
        bank.create_user("carol").unwrap();
        bank.deposit("bob", dec("10.0"), "usd").unwrap();
        assert_eq!(
            bank.send("bob", "carol", dec("10.0"), "usd"),
            Ok((dec("0.0"), dec("10.0")))
        );
        assert_eq!(bank.get_balance("carol", "usd"), Ok(dec("10.0")));
        assert_eq!(bank.get_balance("bob", "usd"), Ok(dec("0.0")));
    }

    #[test]
    fn withdraw_more_than_balance() {
        let bank = bank();
        bank.create_user("dave").unwrap();
        bank.deposit("dave", dec("10.0"), "usd").unwrap();
        assert_eq!(
            bank.withdraw("dave", dec("11.0"), "usd"),
            Err(BankError::NotEnoughFunds)
        );
        // a currency dave never held is just a zero balance
        assert_eq!(
            bank.withdraw("dave", dec("1.0"), "brl"),
            Err(BankError::NotEnoughFunds)
        );
        assert_eq!(bank.get_balance("dave", "usd"), Ok(dec("10.0")));
    }

    #[test]
    fn ghost_endpoints() {
        let bank = bank();
        bank.create_user("alice").unwrap();
        bank.deposit("alice", dec("5.0"), "usd").unwrap();
        assert_eq!(
            bank.send("ghost", "alice", dec("1.0"), "usd"),
            Err(BankError::SenderNotFound)
        );
        assert_eq!(
            bank.send("alice", "ghost", dec("1.0"), "usd"),
            Err(BankError::ReceiverNotFound)
        );
    }

    #[test]
    fn unknown_user_operations() {
        let bank = bank();
        assert_eq!(
            bank.deposit("ghost", dec("1.0"), "usd"),
            Err(BankError::UserDoesNotExist)
        );
        assert_eq!(
            bank.withdraw("ghost", dec("1.0"), "usd"),
            Err(BankError::UserDoesNotExist)
        );
        assert_eq!(
            bank.get_balance("ghost", "usd"),
            Err(BankError::UserDoesNotExist)
        );
    }

    #[test]
    fn argument_validation() {
        let bank = bank();
        bank.create_user("alice").unwrap();
        bank.create_user("bob").unwrap();
        assert_eq!(bank.create_user(""), Err(BankError::WrongArguments));
        assert_eq!(
            bank.deposit("alice", dec("0.0"), "usd"),
            Err(BankError::WrongArguments)
        );
        assert_eq!(
            bank.deposit("alice", dec("-1.0"), "usd"),
            Err(BankError::WrongArguments)
        );
        assert_eq!(
            bank.deposit("alice", dec("1.0"), ""),
            Err(BankError::WrongArguments)
        );
        assert_eq!(
            bank.withdraw("", dec("1.0"), "usd"),
            Err(BankError::WrongArguments)
        );
        assert_eq!(
            bank.send("alice", "alice", dec("1.0"), "usd"),
            Err(BankError::WrongArguments)
        );
        assert_eq!(
            bank.send("alice", "", dec("1.0"), "usd"),
            Err(BankError::WrongArguments)
        );
        assert_eq!(bank.get_balance("alice", ""), Err(BankError::WrongArguments));
    }

    #[test]
    fn amounts_round_half_to_even() {
        let bank = bank();
        bank.create_user("alice").unwrap();
        assert_eq!(bank.deposit("alice", dec("10.005"), "usd"), Ok(dec("10.00")));
        assert_eq!(bank.deposit("alice", dec("10.015"), "usd"), Ok(dec("20.02")));
    }

    #[test]
    fn deposit_withdraw_round_trip() {
        let bank = bank();
        bank.create_user("alice").unwrap();
        bank.deposit("alice", dec("5.25"), "usd").unwrap();
        bank.deposit("alice", dec("3.33"), "usd").unwrap();
        bank.withdraw("alice", dec("3.33"), "usd").unwrap();
        assert_eq!(bank.get_balance("alice", "usd"), Ok(dec("5.25")));
    }

    #[test]
    fn burst_to_one_user_is_bounded() {
        let bank = bank();
        bank.create_user("u").unwrap();
        let barrier = Arc::new(Barrier::new(101));
        let handles: Vec<_> = (0..101)
            .map(|_| {
                let bank = bank.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    bank.deposit("u", dec("10.0"), "usd")
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| **r == Err(BankError::TooManyRequestsToUser))
            .count();
        assert!(ok >= 10, "only {ok} deposits admitted");
        assert_eq!(ok + rejected, 101);

        // the burst drained, the user is admittable again and the balance
        // accounts for exactly the admitted deposits
        bank.deposit("u", dec("10.0"), "usd").unwrap();
        assert_eq!(
            bank.get_balance("u", "usd"),
            Ok(Decimal::new((ok as i64 + 1) * 1000, 2))
        );
    }

    #[test]
    fn concurrent_transfers_conserve_total() {
        let bank = bank();
        bank.create_user("a").unwrap();
        bank.create_user("b").unwrap();
        bank.deposit("a", dec("500.00"), "usd").unwrap();
        bank.deposit("b", dec("500.00"), "usd").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bank = bank.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let (from, to) = if (i + j) % 2 == 0 { ("a", "b") } else { ("b", "a") };
                        match bank.send(from, to, Decimal::ONE, "usd") {
                            Ok(_)
                            | Err(BankError::TooManyRequestsToUser)
                            | Err(BankError::NotEnoughFunds) => {}
                            Err(err) => panic!("unexpected transfer failure: {err}"),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let total =
            bank.get_balance("a", "usd").unwrap() + bank.get_balance("b", "usd").unwrap();
        assert_eq!(total, dec("1000.00"));
    }

    #[quickcheck]
    fn sequential_ops_keep_the_books(ops: Vec<(u8, u8, u8)>) -> TestResult {
        if ops.len() > 40 {
            return TestResult::discard();
        }
        let bank = Bank::new(2).unwrap();
        let users = ["u0", "u1", "u2"];
        for user in users {
            bank.create_user(user).unwrap();
        }
        // expected sum of all usd balances, in cents
        let mut ledger: i64 = 0;
        for (op, user, amount) in ops {
            let index = user as usize % users.len();
            let user = users[index];
            let other = users[(index + 1) % users.len()];
            let cents = (amount as i64 % 500) + 1;
            let amount = Decimal::new(cents, 2);
            match op % 3 {
                0 => {
                    if bank.deposit(user, amount, "usd").is_ok() {
                        ledger += cents;
                    }
                }
                1 => {
                    if bank.withdraw(user, amount, "usd").is_ok() {
                        ledger -= cents;
                    }
                }
                // transfers conserve the total whether they succeed or not
                _ => {
                    let _ = bank.send(user, other, amount, "usd");
                }
            }
        }
        let total: i64 = users
            .iter()
            .map(|user| {
                crate::money::parse(bank.get_balance(user, "usd").unwrap()).unwrap()
            })
            .sum();
        TestResult::from_bool(total == ledger)
    }
}
