//! # Validation Module
//!
//! Input validation for requests entering the engine.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Request shape (serde)                                         │
//! │  ├── Types, required fields                                             │
//! │  └── Unknown enum values                                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                   │
//! │  ├── Quantities, codes, currency, amounts                               │
//! │  └── Runs before any business rule                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                             │
//! │  ├── NOT NULL / CHECK constraints                                       │
//! │  ├── UNIQUE constraints (order number, quote id, coupon code)           │
//! │  └── Foreign key constraints                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use meridian_core::validation::{validate_coupon_code, validate_quantity};
//!
//! validate_coupon_code("SUMMER-10").unwrap();
//! validate_quantity(5).unwrap();
//! ```

use crate::error::ValidationError;
use crate::money::{Money, SCALE};
use crate::{MAX_CART_LINES, MAX_ITEM_QUANTITY, MAX_NOTE_LENGTH};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a coupon code as typed by a customer.
///
/// ## Rules
/// - Must not be empty
/// - At most 100 characters
/// - Letters, digits, `-` and `_` only
///
/// ## Example
/// ```rust
/// use meridian_core::validation::validate_coupon_code;
///
/// assert!(validate_coupon_code("WELCOME_5").is_ok());
/// assert!(validate_coupon_code("").is_err());
/// assert!(validate_coupon_code("two words").is_err());
/// ```
pub fn validate_coupon_code(code: &str) -> ValidationResult<()> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "coupon_code".to_string(),
        });
    }

    if code.chars().count() > 100 {
        return Err(ValidationError::TooLong {
            field: "coupon_code".to_string(),
            max: 100,
        });
    }

    if !code.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: "coupon_code".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates an ISO 4217 currency code (three uppercase letters).
pub fn validate_currency(currency: &str) -> ValidationResult<()> {
    if currency.is_empty() {
        return Err(ValidationError::Required {
            field: "currency".to_string(),
        });
    }

    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: "must be a three-letter ISO 4217 code such as USD".to_string(),
        });
    }

    Ok(())
}

/// Validates an order note.
///
/// ## Returns
/// The trimmed content.
pub fn validate_note(content: &str) -> ValidationResult<String> {
    let content = content.trim();

    if content.is_empty() {
        return Err(ValidationError::Required {
            field: "note".to_string(),
        });
    }

    if content.chars().count() > MAX_NOTE_LENGTH {
        return Err(ValidationError::TooLong {
            field: "note".to_string(),
            max: MAX_NOTE_LENGTH,
        });
    }

    Ok(content.to_string())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a cart line quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY
///
/// ## User Workflow
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  Quote: cart line                                                       │
/// │                                                                         │
/// │  Customer asks for quantity: 5                                          │
/// │       │                                                                 │
/// │       ▼                                                                 │
/// │  validate_quantity(5) ← THIS FUNCTION                                   │
/// │       │                                                                 │
/// │       ├── qty <= 0? → Error: "quantity must be positive"                │
/// │       │                                                                 │
/// │       ├── qty > 9999? → Error: "quantity must be between 1 and 9999"    │
/// │       │                                                                 │
/// │       └── OK → catalog lookup                                           │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates the store's price decimals (0 to 4).
pub fn validate_price_decimals(decimals: u32) -> ValidationResult<()> {
    if decimals > SCALE {
        return Err(ValidationError::OutOfRange {
            field: "price_decimals".to_string(),
            min: 0,
            max: SCALE as i64,
        });
    }

    Ok(())
}

/// Validates an amount that must be zero or more, and at most
/// [`Money::MAX`].
pub fn validate_non_negative(field: &str, amount: Money) -> ValidationResult<()> {
    if amount.is_negative() || amount > Money::MAX {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: Money::MAX.major(),
        });
    }

    Ok(())
}

/// Validates the number of fees on one quote.
pub fn validate_fee_count(fees: usize) -> ValidationResult<()> {
    if fees > MAX_CART_LINES {
        return Err(ValidationError::OutOfRange {
            field: "fees".to_string(),
            min: 0,
            max: MAX_CART_LINES as i64,
        });
    }

    Ok(())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates the number of lines in a cart.
pub fn validate_cart_size(lines: usize) -> ValidationResult<()> {
    if lines > MAX_CART_LINES {
        return Err(ValidationError::OutOfRange {
            field: "cart lines".to_string(),
            min: 1,
            max: MAX_CART_LINES as i64,
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_coupon_code() {
        assert!(validate_coupon_code("SUMMER-10").is_ok());
        assert!(validate_coupon_code("free_ship").is_ok());

        assert!(validate_coupon_code("").is_err());
        assert!(validate_coupon_code("   ").is_err());
        assert!(validate_coupon_code("10% off").is_err());
        assert!(validate_coupon_code(&"A".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_currency() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("EURO").is_err());
        assert!(validate_currency("").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_ITEM_QUANTITY).is_ok());

        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(MAX_ITEM_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_note() {
        assert_eq!(validate_note("  left at door ").unwrap(), "left at door");
        assert!(validate_note("").is_err());
        assert!(validate_note(&"x".repeat(MAX_NOTE_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_numeric_limits() {
        assert!(validate_price_decimals(2).is_ok());
        assert!(validate_price_decimals(5).is_err());
        assert!(validate_non_negative("shipping", Money::ZERO).is_ok());
        assert!(validate_non_negative("shipping", Money::from_units(-1)).is_err());
        assert!(validate_non_negative("shipping", Money::MAX).is_ok());
        assert!(validate_non_negative("shipping", Money::MAX + Money::from_units(1)).is_err());
        assert!(validate_fee_count(MAX_CART_LINES).is_ok());
        assert!(validate_fee_count(MAX_CART_LINES + 1).is_err());
        assert!(validate_cart_size(MAX_CART_LINES).is_ok());
        assert!(validate_cart_size(MAX_CART_LINES + 1).is_err());
    }
}
