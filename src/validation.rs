//! Tax identifier (INN) and e-mail validation.

use std::fmt;

use serde::Serialize;
use validator::ValidateEmail;

use crate::error::{PortalError, Result};

const WEIGHTS_10: [u32; 9] = [2, 4, 10, 3, 5, 9, 4, 6, 8];
const WEIGHTS_12_FIRST: [u32; 10] = [7, 2, 4, 10, 3, 5, 9, 4, 6, 8];
const WEIGHTS_12_SECOND: [u32; 11] = [3, 7, 2, 4, 10, 3, 5, 9, 4, 6, 8];

/// Holder category encoded by the INN length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnKind {
    /// 10 digits.
    Organization,
    /// 12 digits.
    Individual,
}

/// Value object of a checksum-valid INN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Inn(String);

impl Inn {
    /// Converts a string into a valid [`Inn`].
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::InvalidInn`] on wrong length, non-digit
    /// characters or checksum mismatch.
    pub fn parse(inn: &str) -> Result<Self> {
        if is_valid_inn(inn) {
            Ok(Self(inn.to_owned()))
        } else {
            Err(PortalError::InvalidInn)
        }
    }

    pub fn kind(&self) -> InnKind {
        if self.0.len() == 10 {
            InnKind::Organization
        } else {
            InnKind::Individual
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Inn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Inn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Exactly 10 or 12 ASCII digits, checksum not verified.
pub fn has_inn_format(inn: &str) -> bool {
    matches!(inn.len(), 10 | 12) && inn.bytes().all(|b| b.is_ascii_digit())
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    (sum % 11) % 10
}

/// Check an INN against the official checksum algorithm.
pub fn is_valid_inn(inn: &str) -> bool {
    if !has_inn_format(inn) {
        return false;
    }

    let digits: Vec<u32> = inn.bytes().map(|b| u32::from(b - b'0')).collect();
    match digits.len() {
        10 => check_digit(&digits, &WEIGHTS_10) == digits[9],
        12 => {
            check_digit(&digits, &WEIGHTS_12_FIRST) == digits[10]
                && check_digit(&digits, &WEIGHTS_12_SECOND) == digits[11]
        },
        _ => false,
    }
}

/// Check an e-mail address format.
pub fn is_valid_email(email: &str) -> bool {
    !email.is_empty() && email.validate_email()
}
