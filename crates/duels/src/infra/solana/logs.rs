//! Log and error-text classification for chain responses.

use crate::domain::Error;

pub const INSUFFICIENT_FUNDS_MESSAGE: &str = "insufficient funds for proceeding a transaction";
pub const ACCOUNT_UNINITIALIZED_MESSAGE: &str = "solana account is not initialized";

/// Map simulation logs to a typed error. The only recognized program
/// failure is an insufficient-funds log line; everything else is internal.
pub fn parse_logs_for_error(logs: &[String]) -> Error {
    for log in logs {
        if is_insufficient_funds(log) {
            return Error::PaymentRequired(INSUFFICIENT_FUNDS_MESSAGE.to_string());
        }
    }

    Error::Internal("transaction simulation: result err".to_string())
}

pub fn is_insufficient_funds(log: &str) -> bool {
    log.contains("insufficient")
}

/// An RPC error text meaning the target account does not exist yet.
pub fn is_account_uninitialized(message: &str) -> bool {
    message.contains("could not find account") || message.contains("AccountNotFound")
}

/// Single predicate for "the connection under us died" signals. Substring
/// matching stays as a compatibility fallback next to the typed timeout
/// and cancellation cases handled by callers.
pub fn is_broken_connection(message: &str) -> bool {
    message.contains("broken pipe")
        || message.contains("unexpected EOF")
        || message.contains("use of closed network connection")
        || message.contains("websocket: close")
        || message.contains("reset by peer")
        || message.contains("aborted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_log_maps_to_payment_required() {
        let logs = vec![
            "Program log: Instruction: Transfer".to_string(),
            "Program log: Error: insufficient funds".to_string(),
        ];
        let err = parse_logs_for_error(&logs);
        assert!(matches!(err, Error::PaymentRequired(_)));
        assert_eq!(err.status(), 402);
    }

    #[test]
    fn unknown_logs_map_to_internal() {
        let logs = vec!["Program log: custom program error: 0x1".to_string()];
        assert!(matches!(parse_logs_for_error(&logs), Error::Internal(_)));
    }

    #[test]
    fn account_uninitialized_detection() {
        assert!(is_account_uninitialized(
            "could not find account 9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin"
        ));
        assert!(is_account_uninitialized("AccountNotFound"));
        assert!(!is_account_uninitialized("some other rpc error"));
    }

    #[test]
    fn broken_connection_substrings() {
        for msg in [
            "write: broken pipe",
            "unexpected EOF",
            "use of closed network connection",
            "websocket: close 1006",
            "connection reset by peer",
            "request aborted",
        ] {
            assert!(is_broken_connection(msg), "{msg}");
        }
        assert!(!is_broken_connection("rate limited"));
    }
}
