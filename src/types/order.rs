//! Order-related types for the loyalty engine
//!
//! This module defines order numbers (with their checksum validation), user
//! tokens, order statuses and the persisted order record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::LoyaltyError;

/// Opaque identifier of the user owning orders, balances and withdrawals
///
/// The token is issued by the HTTP layer at registration time. The core never
/// interprets its contents; it is only compared and stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserToken(String);

impl UserToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order number that passed the Luhn checksum
///
/// Order numbers are globally unique across all users. Construction through
/// [`OrderNumber::parse`] guarantees the value is a non-empty string of ASCII
/// digits with a valid Luhn check digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Parse and validate an order number
    ///
    /// Surrounding whitespace is ignored.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderNumber)` if the input is all digits and passes the Luhn check
    /// * `Err(LoyaltyError::InvalidOrderNumber)` otherwise
    pub fn parse(raw: &str) -> Result<Self, LoyaltyError> {
        let number = raw.trim();
        if luhn_valid(number) {
            Ok(Self(number.to_string()))
        } else {
            Err(LoyaltyError::invalid_order_number(raw))
        }
    }

    /// Wrap a number read back from storage
    ///
    /// Storage only ever contains numbers that were validated on the way in.
    pub(crate) fn from_stored(number: String) -> Self {
        Self(number)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderNumber {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = LoyaltyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.0
    }
}

/// Luhn (mod 10) checksum over a string of ASCII digits
///
/// Returns false for empty input, single digits and any non-digit character.
pub fn luhn_valid(number: &str) -> bool {
    if number.len() < 2 || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let sum: u32 = number
        .bytes()
        .rev()
        .enumerate()
        .map(|(pos, b)| {
            let digit = u32::from(b - b'0');
            if pos % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                digit
            }
        })
        .sum();

    sum % 10 == 0
}

/// Lifecycle status of an order
///
/// `Invalid` and `Processed` are terminal: once reached, no further
/// transitions occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Accepted by the system, not yet seen by the accrual service
    New,
    /// The accrual service is computing the reward
    Processing,
    /// The accrual service refused the order; no reward
    Invalid,
    /// The reward was computed and credited
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(LoyaltyError::storage(
                "decode_order_status",
                format!("unknown order status '{}'", other),
            )),
        }
    }
}

/// Persisted order record
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// The order number (primary key)
    pub number: OrderNumber,

    /// Owner of the order
    pub user: UserToken,

    /// Current lifecycle status
    pub status: OrderStatus,

    /// Reward credited for the order
    ///
    /// Only meaningful once the order is `Processed`.
    pub accrual: Option<Decimal>,

    /// When the order was submitted
    pub uploaded_at: DateTime<Utc>,

    /// When the order transitioned into `Processed`
    pub processed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Create a freshly submitted order in status `New`
    pub fn new(number: OrderNumber, user: UserToken) -> Self {
        Order {
            number,
            user,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Build a valid order number by appending the Luhn check digit to `base`
#[cfg(test)]
pub(crate) fn order_number_with_check_digit(base: u64) -> OrderNumber {
    (0..=9)
        .map(|digit| format!("{}{}", base, digit))
        .find(|candidate| luhn_valid(candidate))
        .map(OrderNumber)
        .expect("one check digit always satisfies Luhn")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::reference_number("12345678903", true)]
    #[case::card_number("4561261212345467", true)]
    #[case::short_valid("18", true)]
    #[case::bad_check_digit("12345678900", false)]
    #[case::single_digit("0", false)]
    #[case::empty("", false)]
    #[case::letters("1234a678903", false)]
    #[case::inner_space("1234 5678903", false)]
    fn test_luhn_valid(#[case] number: &str, #[case] expected: bool) {
        assert_eq!(luhn_valid(number), expected);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let number = OrderNumber::parse(" 12345678903\n").unwrap();
        assert_eq!(number.as_str(), "12345678903");
    }

    #[test]
    fn test_parse_rejects_invalid_number() {
        let err = OrderNumber::parse("12345678900").unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidOrderNumber { .. }));
    }

    #[test]
    fn test_order_number_deserialize_validates() {
        let ok: Result<OrderNumber, _> = serde_json::from_str("\"12345678903\"");
        assert!(ok.is_ok());

        let bad: Result<OrderNumber, _> = serde_json::from_str("\"12345678900\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_check_digit_helper() {
        assert_eq!(order_number_with_check_digit(1234567890).as_str(), "12345678903");
    }

    #[rstest]
    #[case(OrderStatus::New, "NEW", false)]
    #[case(OrderStatus::Processing, "PROCESSING", false)]
    #[case(OrderStatus::Invalid, "INVALID", true)]
    #[case(OrderStatus::Processed, "PROCESSED", true)]
    fn test_order_status_text(
        #[case] status: OrderStatus,
        #[case] text: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(status.to_string(), text);
        assert_eq!(text.parse::<OrderStatus>().unwrap(), status);
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn test_new_order_starts_in_new() {
        let order = Order::new(
            OrderNumber::parse("12345678903").unwrap(),
            UserToken::new("user-a"),
        );
        assert_eq!(order.status, OrderStatus::New);
        assert!(order.accrual.is_none());
        assert!(order.processed_at.is_none());
    }
}
