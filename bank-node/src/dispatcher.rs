//! Routing parsed commands and translating every outcome into a reply line.
//!
//! Bank-scoped commands (`BC`, `AC`, `BA`, `BN`) always run here. Account
//! commands run here when they name this bank's address and are otherwise
//! relayed verbatim to the named bank. This module is the only place where a
//! failure of any kind becomes an `ER` line.

use std::{fmt, sync::Arc};

use tokio::task::JoinError;
use tracing::error;

use crate::{
    bank::{Bank, BankError, Ledger},
    forward::Forwarder,
    gate::CommitGate,
    protocol::{AccountRef, Command, ParsedCommand},
};

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    BankCode(String),
    AccountCreated { number: u32, address: String },
    Deposited,
    Withdrawn,
    Balance(i64),
    Removed,
    BankAmount(i128),
    BankNumber(usize),
    /// A peer bank's reply, passed through untouched.
    Relayed(String),
    Error(String),
}

impl Reply {
    pub fn error(reason: impl fmt::Display) -> Self {
        Reply::Error(reason.to_string())
    }

    pub fn internal_error() -> Self {
        Reply::error("internal error")
    }

    pub fn timeout() -> Self {
        Reply::error("timeout")
    }

    pub fn idle_timeout() -> Self {
        Reply::error("client idle timeout")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::BankCode(address) => write!(f, "BC {address}"),
            Reply::AccountCreated { number, address } => write!(f, "AC {number}/{address}"),
            Reply::Deposited => f.write_str("AD"),
            Reply::Withdrawn => f.write_str("AW"),
            Reply::Balance(amount) => write!(f, "AB {amount}"),
            Reply::Removed => f.write_str("AR"),
            Reply::BankAmount(amount) => write!(f, "BA {amount}"),
            Reply::BankNumber(count) => write!(f, "BN {count}"),
            Reply::Relayed(line) => f.write_str(line),
            Reply::Error(reason) => write!(f, "ER {reason}"),
        }
    }
}

/// Why local work produced no reply of its own.
#[derive(Debug)]
enum LocalFailure {
    Bank(BankError),
    /// The waiting connection gave up before the work claimed its gate.
    Abandoned,
    Join(JoinError),
}

impl From<BankError> for LocalFailure {
    fn from(err: BankError) -> Self {
        LocalFailure::Bank(err)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    bank: Arc<Bank>,
    forwarder: Forwarder,
}

impl Dispatcher {
    pub fn new(bank: Arc<Bank>, forwarder: Forwarder) -> Self {
        Self { bank, forwarder }
    }

    pub fn address(&self) -> &str {
        self.bank.address()
    }

    /// Parses and executes one request line.
    pub async fn handle_line(&self, line: &str) -> Reply {
        match ParsedCommand::parse(line) {
            Ok(parsed) => self.execute(parsed, &CommitGate::new()).await,
            Err(err) => Reply::error(err),
        }
    }

    /// Executes a parsed command.
    ///
    /// Local work only touches the account table after claiming `gate`; if the
    /// caller has abandoned the gate by then, nothing is changed.
    pub async fn execute(&self, parsed: ParsedCommand, gate: &CommitGate) -> Reply {
        let ParsedCommand { command, raw } = parsed;

        if let Some(target) = command.target() {
            if target.address != self.address() {
                return match self.forwarder.forward(&target.address, &raw).await {
                    Ok(line) => Reply::Relayed(line),
                    Err(err) => Reply::error(err),
                };
            }
        }

        match command {
            Command::BankCode => Reply::BankCode(self.address().to_string()),
            Command::CreateAccount => self
                .run_local(gate, |ledger| ledger.create_account())
                .await
                .map(|account| Reply::AccountCreated {
                    number: account.number,
                    address: self.address().to_string(),
                })
                .unwrap_or_else(render_failure),
            Command::BankAmount => self
                .run_local(gate, |ledger| Ok(ledger.total_balance()))
                .await
                .map(Reply::BankAmount)
                .unwrap_or_else(render_failure),
            Command::BankNumber => self
                .run_local(gate, |ledger| Ok(ledger.account_count()))
                .await
                .map(Reply::BankNumber)
                .unwrap_or_else(render_failure),
            Command::Balance { target } => {
                self.account_op(gate, target, |ledger, number, address| {
                    ledger.balance_of(number, &address).map(Reply::Balance)
                })
                .await
            }
            Command::Remove { target } => {
                self.account_op(gate, target, |ledger, number, address| {
                    ledger.remove_account(number, &address).map(|()| Reply::Removed)
                })
                .await
            }
            Command::Deposit { target, amount } => {
                self.account_op(gate, target, move |ledger, number, address| {
                    ledger
                        .deposit(number, &address, amount)
                        .map(|()| Reply::Deposited)
                })
                .await
            }
            Command::Withdraw { target, amount } => {
                self.account_op(gate, target, move |ledger, number, address| {
                    ledger
                        .withdraw(number, &address, amount)
                        .map(|()| Reply::Withdrawn)
                })
                .await
            }
        }
    }

    async fn account_op<F>(&self, gate: &CommitGate, target: AccountRef, op: F) -> Reply
    where
        F: FnOnce(&mut Ledger<'_>, u32, String) -> Result<Reply, BankError> + Send + 'static,
    {
        let Ok(number) = target.account.parse::<u32>() else {
            return Reply::error("invalid account number");
        };
        let address = target.address;
        self.run_local(gate, move |ledger| op(ledger, number, address))
            .await
            .unwrap_or_else(render_failure)
    }

    /// Runs `op` against the bank on the blocking pool, since it may wait for
    /// the lock and always waits for disk on mutation.
    async fn run_local<T, F>(&self, gate: &CommitGate, op: F) -> Result<T, LocalFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut Ledger<'_>) -> Result<T, BankError> + Send + 'static,
    {
        let bank = Arc::clone(&self.bank);
        let gate = gate.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut ledger = bank.lock();
            if !gate.begin_commit() {
                return Err(LocalFailure::Abandoned);
            }
            op(&mut ledger).map_err(LocalFailure::from)
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(err) => Err(LocalFailure::Join(err)),
        }
    }
}

fn render_failure(failure: LocalFailure) -> Reply {
    match failure {
        LocalFailure::Bank(err) if err.is_internal() => {
            error!(error = %err, "bank operation failed");
            Reply::internal_error()
        }
        LocalFailure::Bank(err) => Reply::error(err),
        LocalFailure::Abandoned => Reply::timeout(),
        LocalFailure::Join(err) => {
            error!(error = ?err, "bank operation did not complete");
            Reply::internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::*;
    use crate::{events::Events, snapshot::SnapshotStore};

    const ADDRESS: &str = "10.0.0.5";

    fn dispatcher_for(address: &str) -> (TempDir, Dispatcher) {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path().join("bank-state.json"));
        let bank = Arc::new(Bank::open(address, snapshots, Events::new()));
        let forwarder = Forwarder::new(65530, Duration::from_millis(500));
        (dir, Dispatcher::new(bank, forwarder))
    }

    async fn line(dispatcher: &Dispatcher, request: &str) -> String {
        dispatcher.handle_line(request).await.to_string()
    }

    #[tokio::test]
    async fn full_account_lifecycle() {
        let (_dir, dispatcher) = dispatcher_for(ADDRESS);

        assert_eq!(line(&dispatcher, "BC").await, "BC 10.0.0.5");
        assert_eq!(line(&dispatcher, "AC").await, "AC 10000/10.0.0.5");
        assert_eq!(line(&dispatcher, "AD 10000/10.0.0.5 500").await, "AD");
        assert_eq!(line(&dispatcher, "AB 10000/10.0.0.5").await, "AB 500");
        assert_eq!(
            line(&dispatcher, "AW 10000/10.0.0.5 600").await,
            "ER insufficient funds"
        );
        assert_eq!(
            line(&dispatcher, "AR 10000/10.0.0.5").await,
            "ER cannot remove an account with a non-zero balance"
        );
        assert_eq!(
            line(&dispatcher, "AD 10000/10.0.0.5 -1").await,
            "ER amount must not be negative"
        );
        assert_eq!(line(&dispatcher, "AW 10000/10.0.0.5 500").await, "AW");
        assert_eq!(line(&dispatcher, "AR 10000/10.0.0.5").await, "AR");
        assert_eq!(line(&dispatcher, "BN").await, "BN 0");
    }

    #[tokio::test]
    async fn bank_totals_cover_all_accounts() {
        let (_dir, dispatcher) = dispatcher_for(ADDRESS);
        for _ in 0..3 {
            dispatcher.handle_line("AC").await;
        }
        dispatcher.handle_line("AD 10000/10.0.0.5 10").await;
        dispatcher.handle_line("AD 10002/10.0.0.5 32").await;

        assert_eq!(line(&dispatcher, "BA").await, "BA 42");
        assert_eq!(line(&dispatcher, "BN").await, "BN 3");
    }

    #[tokio::test]
    async fn parse_and_validation_errors_become_er_lines() {
        let (_dir, dispatcher) = dispatcher_for(ADDRESS);

        assert_eq!(line(&dispatcher, "ZZ").await, "ER unknown command");
        assert_eq!(
            line(&dispatcher, "AB 12345").await,
            "ER invalid <account>/<address> format"
        );
        assert_eq!(
            line(&dispatcher, "AB abc/10.0.0.5").await,
            "ER invalid account number"
        );
        assert_eq!(
            line(&dispatcher, "AB 123/10.0.0.5").await,
            "ER account number must be in range 10000-99999"
        );
        assert_eq!(
            line(&dispatcher, "AB 12345/10.0.0.5").await,
            "ER account does not exist"
        );
    }

    #[tokio::test]
    async fn unreachable_peer_yields_a_proxy_sentinel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let dead = listener.local_addr().expect("addr");
        drop(listener);
        let (_dir, dispatcher) = dispatcher_for(ADDRESS);

        let reply = line(&dispatcher, &format!("AB 10000/{dead}")).await;

        assert_eq!(reply, "ER proxy: connection failed");
    }

    #[tokio::test]
    async fn abandoned_gate_prevents_mutation() {
        let (_dir, dispatcher) = dispatcher_for(ADDRESS);
        let gate = CommitGate::new();
        assert!(gate.abandon());

        let parsed = ParsedCommand::parse("AC").expect("parse");
        let reply = dispatcher.execute(parsed, &gate).await;

        assert_eq!(reply, Reply::timeout());
        assert_eq!(line(&dispatcher, "BN").await, "BN 0");
    }

    #[test]
    fn replies_render_protocol_lines() {
        assert_eq!(
            Reply::AccountCreated {
                number: 10001,
                address: "h".into()
            }
            .to_string(),
            "AC 10001/h"
        );
        assert_eq!(Reply::BankAmount(42).to_string(), "BA 42");
        assert_eq!(Reply::Relayed("AB 7".into()).to_string(), "AB 7");
        assert_eq!(Reply::idle_timeout().to_string(), "ER client idle timeout");
        assert!(Reply::internal_error().is_error());
    }
}
