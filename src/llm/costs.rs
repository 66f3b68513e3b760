//! Per-token list prices for known models.

use rust_decimal::Decimal;

/// USD per token (input, output). Unknown models cost zero.
pub fn pricing_for(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    if model.starts_with("gpt-4o-mini") {
        (Decimal::new(15, 8), Decimal::new(60, 8))
    } else if model.starts_with("gpt-4o") {
        (Decimal::new(25, 7), Decimal::new(1, 5))
    } else if model.starts_with("gpt-4.1-mini") {
        (Decimal::new(40, 8), Decimal::new(16, 7))
    } else if model.contains("haiku") {
        (Decimal::new(8, 7), Decimal::new(4, 6))
    } else if model.contains("sonnet") {
        (Decimal::new(3, 6), Decimal::new(15, 6))
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    }
}
