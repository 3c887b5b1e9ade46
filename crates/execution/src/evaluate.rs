//! Pure operation semantics.
//!
//! Every execution path (sequential, speculative and validated) goes through
//! [`evaluate`], so they produce the same result for the same reads.

use palisade_types::{Operation, OperationResult};

/// Writes produced by one operation, in application order.
pub type Writes = Vec<(String, Vec<u8>)>;

/// Keys an operation reads.
pub fn read_keys(operation: &Operation) -> Vec<&str> {
    match operation {
        Operation::Put { .. } | Operation::Noop => Vec::new(),
        Operation::Get { key } => vec![key.as_str()],
        Operation::Transfer { from, to, .. } => {
            if from == to {
                vec![from.as_str()]
            } else {
                vec![from.as_str(), to.as_str()]
            }
        }
    }
}

/// Decode a stored balance. Missing or malformed values count as zero.
pub fn balance(value: Option<&[u8]>) -> u64 {
    value
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Apply `operation` to the state visible through `read`.
pub fn evaluate(
    operation: &Operation,
    read: impl Fn(&str) -> Option<Vec<u8>>,
) -> (OperationResult, Writes) {
    match operation {
        Operation::Put { key, value } => (OperationResult::Stored, vec![(key.clone(), value.clone())]),
        Operation::Get { key } => (OperationResult::Value(read(key)), Vec::new()),
        Operation::Transfer { from, to, amount } => {
            let source = balance(read(from).as_deref());
            if source < *amount {
                return (OperationResult::InsufficientFunds, Vec::new());
            }
            if from == to {
                return (
                    OperationResult::Transferred,
                    vec![(from.clone(), source.to_le_bytes().to_vec())],
                );
            }
            let target = balance(read(to).as_deref());
            (
                OperationResult::Transferred,
                vec![
                    (from.clone(), (source - amount).to_le_bytes().to_vec()),
                    (to.clone(), target.saturating_add(*amount).to_le_bytes().to_vec()),
                ],
            )
        }
        Operation::Noop => (OperationResult::Noop, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn state(entries: &[(&str, u64)]) -> HashMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_le_bytes().to_vec()))
            .collect()
    }

    fn transfer(from: &str, to: &str, amount: u64) -> Operation {
        Operation::Transfer {
            from: from.to_string(),
            to: to.to_string(),
            amount,
        }
    }

    #[test]
    fn test_transfer_moves_balance() {
        let state = state(&[("alice", 10)]);
        let (result, writes) = evaluate(&transfer("alice", "bob", 4), |k| state.get(k).cloned());
        assert_eq!(result, OperationResult::Transferred);
        assert_eq!(
            writes,
            vec![
                ("alice".to_string(), 6u64.to_le_bytes().to_vec()),
                ("bob".to_string(), 4u64.to_le_bytes().to_vec()),
            ]
        );
    }

    #[test]
    fn test_insufficient_funds_writes_nothing() {
        let state = state(&[("alice", 3)]);
        let (result, writes) = evaluate(&transfer("alice", "bob", 4), |k| state.get(k).cloned());
        assert_eq!(result, OperationResult::InsufficientFunds);
        assert!(writes.is_empty());
    }

    #[test]
    fn test_self_transfer_keeps_balance() {
        let state = state(&[("alice", 5)]);
        let (result, writes) = evaluate(&transfer("alice", "alice", 5), |k| state.get(k).cloned());
        assert_eq!(result, OperationResult::Transferred);
        assert_eq!(writes, vec![("alice".to_string(), 5u64.to_le_bytes().to_vec())]);
        assert_eq!(read_keys(&transfer("alice", "alice", 5)), vec!["alice"]);
    }

    #[test]
    fn test_get_and_put() {
        let (result, writes) = evaluate(&Operation::Get { key: "k".into() }, |_| Some(vec![1]));
        assert_eq!(result, OperationResult::Value(Some(vec![1])));
        assert!(writes.is_empty());

        let put = Operation::Put {
            key: "k".into(),
            value: vec![2],
        };
        assert_eq!(
            evaluate(&put, |_| None),
            (OperationResult::Stored, vec![("k".to_string(), vec![2])])
        );
        assert_eq!(balance(Some(&[1, 2, 3])), 0);
    }
}
