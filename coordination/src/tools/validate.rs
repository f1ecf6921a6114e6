//! Allow-list validation of tool arguments.
//!
//! Arguments arrive as one string written by a language model. They are
//! split with shell quoting rules and every token is checked against a
//! fixed shape before anything reaches a backend.

use std::sync::LazyLock;

use regex::Regex;

use super::{ToolError, ToolKind};

/// Upper bound on the raw argument string for any tool.
pub const MAX_ARGS_LEN: usize = 100_000;
/// Bytecode limit in bytes (hex doubles it).
pub const MAX_BYTECODE_BYTES: usize = 48 * 1024;
pub const MAX_STATUS_CHARS: usize = 140;
const MAX_AMOUNT_LEN: usize = 32;

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap());
static TX_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").unwrap());
static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{1,20}$").unwrap());
static AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,32}(\.[0-9]{1,18})?$").unwrap());
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^0x([0-9a-fA-F]{2})+$").unwrap());

/// Validate `args` for `kind` and return the backend argv.
pub fn validate(kind: ToolKind, args: &str) -> Result<Vec<String>, ToolError> {
    let invalid = |reason: String| ToolError::InvalidArguments {
        tool: kind.name(),
        reason,
    };

    if args.len() > MAX_ARGS_LEN {
        return Err(invalid(format!("arguments exceed {MAX_ARGS_LEN} bytes")));
    }
    if args.chars().any(|c| c.is_control() && c != ' ') {
        return Err(invalid("control characters are not allowed".into()));
    }
    let tokens = shlex::split(args).ok_or_else(|| invalid("unbalanced quotes".into()))?;

    match kind {
        ToolKind::CheckBalance | ToolKind::RegisterWallet => {
            let [address] = exact::<1>(&tokens).map_err(invalid)?;
            check_address(address).map_err(invalid)?;
        }
        ToolKind::GetProposal => {
            let [id] = exact::<1>(&tokens).map_err(invalid)?;
            check_id(id).map_err(invalid)?;
        }
        ToolKind::GetTransaction => {
            let [hash] = exact::<1>(&tokens).map_err(invalid)?;
            if !TX_HASH_RE.is_match(hash) {
                return Err(invalid(format!("`{}` is not a transaction hash", clip(hash))));
            }
        }
        ToolKind::SetStatus => {
            let text = tokens.join(" ");
            if text.trim().is_empty() {
                return Err(invalid("status text is empty".into()));
            }
            if text.chars().count() > MAX_STATUS_CHARS {
                return Err(invalid(format!(
                    "status text exceeds {MAX_STATUS_CHARS} characters"
                )));
            }
            return Ok(vec![text]);
        }
        ToolKind::Transfer | ToolKind::MintReward => {
            let [address, amount] = exact::<2>(&tokens).map_err(invalid)?;
            check_address(address).map_err(invalid)?;
            check_amount(amount).map_err(invalid)?;
        }
        ToolKind::CastGovernanceVote => {
            let [id, choice] = exact::<2>(&tokens).map_err(invalid)?;
            check_id(id).map_err(invalid)?;
            if !matches!(choice.as_str(), "yes" | "no" | "abstain") {
                return Err(invalid(format!(
                    "vote must be yes, no or abstain, got `{}`",
                    clip(choice)
                )));
            }
        }
        ToolKind::DeployContract => {
            let [bytecode] = exact::<1>(&tokens).map_err(invalid)?;
            if !HEX_RE.is_match(bytecode) {
                return Err(invalid("bytecode must be 0x-prefixed, even-length hex".into()));
            }
            if (bytecode.len() - 2) / 2 > MAX_BYTECODE_BYTES {
                return Err(invalid(format!(
                    "bytecode exceeds {MAX_BYTECODE_BYTES} bytes"
                )));
            }
        }
    }

    Ok(tokens)
}

fn exact<const N: usize>(tokens: &[String]) -> Result<&[String; N], String> {
    tokens
        .try_into()
        .map_err(|_| format!("expected {N} argument(s), got {}", tokens.len()))
}

fn check_address(value: &str) -> Result<(), String> {
    if ADDRESS_RE.is_match(value) {
        Ok(())
    } else {
        Err(format!("`{}` is not a 0x-prefixed 20-byte address", clip(value)))
    }
}

fn check_id(value: &str) -> Result<(), String> {
    if ID_RE.is_match(value) {
        Ok(())
    } else {
        Err(format!("`{}` is not a numeric id", clip(value)))
    }
}

fn check_amount(value: &str) -> Result<(), String> {
    if value.len() > MAX_AMOUNT_LEN || !AMOUNT_RE.is_match(value) {
        return Err(format!("`{}` is not a decimal amount", clip(value)));
    }
    if !value.chars().any(|c| c.is_ascii_digit() && c != '0') {
        return Err("amount must be greater than zero".into());
    }
    Ok(())
}

/// Shorten echoed input so error strings stay small.
fn clip(value: &str) -> String {
    const LIMIT: usize = 48;
    if value.chars().count() <= LIMIT {
        value.to_string()
    } else {
        let head: String = value.chars().take(LIMIT).collect();
        format!("{head}…")
    }
}
