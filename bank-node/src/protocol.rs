//! Command parsing for the bank wire protocol.
//!
//! Every request is a single line: a two-letter, case-insensitive command code
//! followed by zero, one or two whitespace-separated arguments. The parser only
//! checks shape. Account numbers stay textual here because a command naming a
//! foreign bank is relayed verbatim, and negative amounts are left for the
//! account store to reject.

use std::fmt;

use thiserror::Error;

/// The two-letter command codes understood by a bank node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    /// Bank code: report this node's address.
    Bc,
    /// Account create.
    Ac,
    /// Account deposit.
    Ad,
    /// Account withdrawal.
    Aw,
    /// Account balance.
    Ab,
    /// Account remove.
    Ar,
    /// Bank amount: sum of all balances.
    Ba,
    /// Bank number: count of accounts.
    Bn,
}

impl CommandCode {
    fn from_token(token: &str) -> Option<Self> {
        let code = match token.to_ascii_uppercase().as_str() {
            "BC" => CommandCode::Bc,
            "AC" => CommandCode::Ac,
            "AD" => CommandCode::Ad,
            "AW" => CommandCode::Aw,
            "AB" => CommandCode::Ab,
            "AR" => CommandCode::Ar,
            "BA" => CommandCode::Ba,
            "BN" => CommandCode::Bn,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandCode::Bc => "BC",
            CommandCode::Ac => "AC",
            CommandCode::Ad => "AD",
            CommandCode::Aw => "AW",
            CommandCode::Ab => "AB",
            CommandCode::Ar => "AR",
            CommandCode::Ba => "BA",
            CommandCode::Bn => "BN",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `<account>/<address>` pair exactly as the client wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRef {
    pub account: String,
    pub address: String,
}

impl AccountRef {
    fn parse(token: &str) -> Result<Self, ParseError> {
        match token.split_once('/') {
            Some((account, address)) if !account.is_empty() && !address.is_empty() => {
                Ok(AccountRef {
                    account: account.to_string(),
                    address: address.to_string(),
                })
            }
            _ => Err(ParseError::InvalidAccountAddress),
        }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.address)
    }
}

/// A request in structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BankCode,
    CreateAccount,
    BankAmount,
    BankNumber,
    Balance { target: AccountRef },
    Remove { target: AccountRef },
    Deposit { target: AccountRef, amount: i64 },
    Withdraw { target: AccountRef, amount: i64 },
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::BankCode => CommandCode::Bc,
            Command::CreateAccount => CommandCode::Ac,
            Command::BankAmount => CommandCode::Ba,
            Command::BankNumber => CommandCode::Bn,
            Command::Balance { .. } => CommandCode::Ab,
            Command::Remove { .. } => CommandCode::Ar,
            Command::Deposit { .. } => CommandCode::Ad,
            Command::Withdraw { .. } => CommandCode::Aw,
        }
    }

    /// The account this command addresses, if it addresses one at all.
    pub fn target(&self) -> Option<&AccountRef> {
        match self {
            Command::Balance { target }
            | Command::Remove { target }
            | Command::Deposit { target, .. }
            | Command::Withdraw { target, .. } => Some(target),
            Command::BankCode
            | Command::CreateAccount
            | Command::BankAmount
            | Command::BankNumber => None,
        }
    }
}

/// A parsed command plus the trimmed line it came from, kept for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: Command,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command")]
    Unknown,
    #[error("{0} takes no parameters")]
    NoParameters(CommandCode),
    #[error("{0} expects <account>/<address>")]
    ExpectsAccount(CommandCode),
    #[error("{0} expects <account>/<address> <amount>")]
    ExpectsAccountAmount(CommandCode),
    #[error("invalid <account>/<address> format")]
    InvalidAccountAddress,
    #[error("invalid amount")]
    InvalidAmount,
}

impl ParsedCommand {
    /// Parses one request line.
    ///
    /// Leading and trailing whitespace (including a trailing `\r`) is ignored.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let raw = line.trim();
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(ParseError::Empty);
        };
        let code = CommandCode::from_token(first).ok_or(ParseError::Unknown)?;

        let command = match code {
            CommandCode::Bc | CommandCode::Ac | CommandCode::Ba | CommandCode::Bn => {
                if parts.len() != 1 {
                    return Err(ParseError::NoParameters(code));
                }
                match code {
                    CommandCode::Bc => Command::BankCode,
                    CommandCode::Ac => Command::CreateAccount,
                    CommandCode::Ba => Command::BankAmount,
                    _ => Command::BankNumber,
                }
            }
            CommandCode::Ab | CommandCode::Ar => {
                if parts.len() != 2 {
                    return Err(ParseError::ExpectsAccount(code));
                }
                let target = AccountRef::parse(parts[1])?;
                if code == CommandCode::Ab {
                    Command::Balance { target }
                } else {
                    Command::Remove { target }
                }
            }
            CommandCode::Ad | CommandCode::Aw => {
                if parts.len() != 3 {
                    return Err(ParseError::ExpectsAccountAmount(code));
                }
                let target = AccountRef::parse(parts[1])?;
                let amount = parts[2]
                    .parse::<i64>()
                    .map_err(|_| ParseError::InvalidAmount)?;
                if code == CommandCode::Ad {
                    Command::Deposit { target, amount }
                } else {
                    Command::Withdraw { target, amount }
                }
            }
        };

        Ok(ParsedCommand {
            command,
            raw: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(account: &str, address: &str) -> AccountRef {
        AccountRef {
            account: account.into(),
            address: address.into(),
        }
    }

    #[test]
    fn parses_deposit_with_account_address_and_amount() {
        let parsed = ParsedCommand::parse("AD 12345/10.0.0.5 100").expect("valid deposit");
        assert_eq!(
            parsed.command,
            Command::Deposit {
                target: target("12345", "10.0.0.5"),
                amount: 100
            }
        );
        assert_eq!(parsed.raw, "AD 12345/10.0.0.5 100");
    }

    #[test]
    fn codes_are_case_insensitive() {
        assert!(matches!(
            ParsedCommand::parse("bc").map(|p| p.command),
            Ok(Command::BankCode)
        ));
        assert!(matches!(
            ParsedCommand::parse("Ac").map(|p| p.command),
            Ok(Command::CreateAccount)
        ));
        assert!(matches!(
            ParsedCommand::parse("ab 10000/1.2.3.4").map(|p| p.command),
            Ok(Command::Balance { .. })
        ));
    }

    #[test]
    fn raw_line_is_trimmed_but_otherwise_untouched() {
        let parsed = ParsedCommand::parse("  aw 10001/host   7\r\n").expect("valid withdraw");
        assert_eq!(parsed.raw, "aw 10001/host   7");
        assert_eq!(
            parsed.command,
            Command::Withdraw {
                target: target("10001", "host"),
                amount: 7
            }
        );
    }

    #[test]
    fn empty_lines_are_rejected() {
        assert_eq!(ParsedCommand::parse(""), Err(ParseError::Empty));
        assert_eq!(ParsedCommand::parse("   \t "), Err(ParseError::Empty));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(ParsedCommand::parse("ZZ"), Err(ParseError::Unknown));
        assert_eq!(ParsedCommand::parse("ADD 1/2 3"), Err(ParseError::Unknown));
    }

    #[test]
    fn arity_errors_name_the_code() {
        assert_eq!(
            ParsedCommand::parse("BN extra"),
            Err(ParseError::NoParameters(CommandCode::Bn))
        );
        assert_eq!(
            ParsedCommand::parse("ar"),
            Err(ParseError::ExpectsAccount(CommandCode::Ar))
        );
        assert_eq!(
            ParsedCommand::parse("AD 10000/h"),
            Err(ParseError::ExpectsAccountAmount(CommandCode::Ad))
        );
        assert_eq!(
            ParseError::ExpectsAccountAmount(CommandCode::Aw).to_string(),
            "AW expects <account>/<address> <amount>"
        );
    }

    #[test]
    fn account_without_address_is_a_format_error() {
        assert_eq!(
            ParsedCommand::parse("AB 12345"),
            Err(ParseError::InvalidAccountAddress)
        );
        assert_eq!(
            ParsedCommand::parse("AB /10.0.0.5"),
            Err(ParseError::InvalidAccountAddress)
        );
        assert_eq!(
            ParsedCommand::parse("AB 12345/"),
            Err(ParseError::InvalidAccountAddress)
        );
    }

    #[test]
    fn address_keeps_everything_after_the_first_slash() {
        let parsed = ParsedCommand::parse("AB 10000/a/b").expect("valid balance");
        assert_eq!(parsed.command.target(), Some(&target("10000", "a/b")));
    }

    #[test]
    fn amounts_must_be_integers_but_may_be_negative() {
        assert_eq!(
            ParsedCommand::parse("AD 10000/h 1.5"),
            Err(ParseError::InvalidAmount)
        );
        assert_eq!(
            ParsedCommand::parse("AD 10000/h 99999999999999999999"),
            Err(ParseError::InvalidAmount)
        );
        assert!(matches!(
            ParsedCommand::parse("AD 10000/h -1").map(|p| p.command),
            Ok(Command::Deposit { amount: -1, .. })
        ));
    }
}
