use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::PathBuf;
use teller::bank::{Bank, BankError, SetupError};
use thiserror::Error;

/// Run a scripted session against the banking core: one command per CSV row
/// in, one result row per command out.
#[derive(Parser)]
struct Cmd {
    /// Input file with one command per row
    path: PathBuf,
    /// Output file for results, defaults to stdout
    output_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Deserialize, Debug)]
struct CommandCsv {
    op: OpKind,
    user: String,
    to: Option<String>,
    amount: Option<Decimal>,
    currency: Option<String>,
}

#[derive(Deserialize, Debug, Copy, Clone)]
#[serde(rename_all = "lowercase")]
enum OpKind {
    Create,
    Deposit,
    Withdraw,
    Send,
    Balance,
}

#[derive(serde::Serialize)]
struct ResultRecord {
    op: &'static str,
    user: String,
    outcome: &'static str,
    balance: Option<Decimal>,
    counterparty_balance: Option<Decimal>,
}

impl Cmd {
    fn exec(self) -> Result<(), Error> {
        let commands = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(self.path)?;

        let bank = Bank::new(num_cpus::get())?;
        let mut results = Vec::new();
        for command in commands.into_deserialize::<CommandCsv>() {
            results.push(run_command(&bank, command?));
        }

        if let Some(filepath) = self.output_file {
            write_results_to_csv(results, std::fs::File::create(&filepath)?)?;
        } else {
            write_results_to_csv(results, std::io::stdout())?;
        }
        Ok(())
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();
    Cmd::parse().exec()
}

fn run_command(bank: &Bank, command: CommandCsv) -> ResultRecord {
    let CommandCsv {
        op,
        user,
        to,
        amount,
        currency,
    } = command;
    let currency = currency.unwrap_or_default();
    let (op, outcome) = match op {
        OpKind::Create => ("create", bank.create_user(&user).map(|()| (None, None))),
        OpKind::Deposit => (
            "deposit",
            with_amount(amount, |amount| {
                bank.deposit(&user, amount, &currency)
                    .map(|balance| (Some(balance), None))
            }),
        ),
        OpKind::Withdraw => (
            "withdraw",
            with_amount(amount, |amount| {
                bank.withdraw(&user, amount, &currency)
                    .map(|balance| (Some(balance), None))
            }),
        ),
        OpKind::Send => (
            "send",
            match (to.as_deref(), amount) {
                (Some(to), Some(amount)) => bank
                    .send(&user, to, amount, &currency)
                    .map(|(sender, receiver)| (Some(sender), Some(receiver))),
                _ => Err(BankError::WrongArguments),
            },
        ),
        OpKind::Balance => (
            "balance",
            bank.get_balance(&user, &currency)
                .map(|balance| (Some(balance), None)),
        ),
    };
    match outcome {
        Ok((balance, counterparty_balance)) => ResultRecord {
            op,
            user,
            outcome: "ok",
            balance,
            counterparty_balance,
        },
        Err(err) => ResultRecord {
            op,
            user,
            outcome: error_code(err),
            balance: None,
            counterparty_balance: None,
        },
    }
}

fn with_amount<F>(amount: Option<Decimal>, run: F) -> Result<(Option<Decimal>, Option<Decimal>), BankError>
where
    F: FnOnce(Decimal) -> Result<(Option<Decimal>, Option<Decimal>), BankError>,
{
    match amount {
        Some(amount) => run(amount),
        None => Err(BankError::WrongArguments),
    }
}

fn error_code(err: BankError) -> &'static str {
    match err {
        BankError::WrongArguments => "wrong_arguments",
        BankError::UserAlreadyExists => "user_already_exists",
        BankError::UserDoesNotExist => "user_does_not_exist",
        BankError::SenderNotFound => "sender_not_found",
        BankError::ReceiverNotFound => "receiver_not_found",
        BankError::NotEnoughFunds => "not_enough_funds",
        BankError::TooManyRequestsToUser => "too_many_requests_to_user",
        BankError::Unexpected => "unexpected",
    }
}

fn write_results_to_csv<W: std::io::Write>(
    results: Vec<ResultRecord>,
    writer: W,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for record in results {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn example() {
        let csv = r#"
    op, user, to, amount, currency
    create, alice, , ,
    create, bob, , ,
    deposit, alice, , 50.0, usd
    send, alice, bob, 12.5, usd
    withdraw, bob, , 100.0, usd
    balance, bob, , , usd
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let out = tempfile::NamedTempFile::new().unwrap();
        file.write_all(csv.as_bytes()).unwrap();

        Cmd {
            path: file.path().to_path_buf(),
            output_file: Some(out.path().to_owned()),
        }
        .exec()
        .unwrap();

        let found = std::fs::read_to_string(out.path())
            .unwrap()
            .replace(' ', "");
        assert_eq!(
            found.trim(),
            r#"op,user,outcome,balance,counterparty_balance
            create,alice,ok,,
            create,bob,ok,,
            deposit,alice,ok,50.00,
            send,alice,ok,37.50,12.50
            withdraw,bob,not_enough_funds,,
            balance,bob,ok,12.50,"#
                .replace(' ', "")
        );
    }
}
