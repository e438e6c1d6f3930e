// src/utils/id_generator.rs
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Order,
    Transaction,
    History,
    Session,
}

impl IdType {
    pub fn to_prefix(&self) -> &'static str {
        match self {
            IdType::Order => "ord",
            IdType::Transaction => "txn",
            IdType::History => "his",
            IdType::Session => "ses",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_prefix())
    }
}

/// Prefix of the idempotency keys the dispatch engine uses for fees
pub const FEE_KEY_PREFIX: &str = "opfee:";

pub struct IdGenerator;

impl IdGenerator {
    /// Generate a unique ID with format: {prefix}-{date}-{random_suffix}
    pub fn generate(id_type: IdType) -> String {
        Self::generate_with_timestamp(id_type, Utc::now())
    }

    /// Generate ID with a specific timestamp (useful for testing)
    pub fn generate_with_timestamp(id_type: IdType, timestamp: DateTime<Utc>) -> String {
        let date_part = timestamp.format("%y%m%d").to_string(); // YYMMDD format
        let random_suffix = Self::generate_random_suffix();

        format!("{}-{}-{}", id_type.to_prefix(), date_part, random_suffix)
    }

    /// Human-readable order number, sequential within a calendar day
    pub fn order_number(day: NaiveDate, sequence: u64) -> String {
        format!("TX-{}-{:04}", day.format("%Y%m%d"), sequence)
    }

    /// Idempotency key for the operational fee of one order
    pub fn fee_key(order_id: &str) -> String {
        format!("{}{}", FEE_KEY_PREFIX, order_id)
    }

    /// 5 characters: 3 hex + 2 alphanumeric, or the other way round
    fn generate_random_suffix() -> String {
        if rand::random::<bool>() {
            format!(
                "{}{}",
                Self::generate_hex_chars(3),
                Self::generate_alphanumeric_chars(2)
            )
        } else {
            format!(
                "{}{}",
                Self::generate_alphanumeric_chars(3),
                Self::generate_hex_chars(2)
            )
        }
    }

    fn generate_hex_chars(n: usize) -> String {
        const HEX_CHARS: &[u8] = b"0123456789abcdef";
        Self::generate_from_chars(HEX_CHARS, n)
    }

    fn generate_alphanumeric_chars(n: usize) -> String {
        const ALPHANUMERIC_CHARS: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        Self::generate_from_chars(ALPHANUMERIC_CHARS, n)
    }

    fn generate_from_chars(charset: &[u8], n: usize) -> String {
        let mut rng = rand::rng();
        (0..n)
            .map(|_| charset[rng.random_range(0..charset.len())] as char)
            .collect()
    }
}
