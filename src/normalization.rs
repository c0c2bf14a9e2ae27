//! Conversions from raw on-chain integer amounts and feed prices into `Decimal`.
//!
//! `Decimal` holds 96-bit mantissas with up to 28 fractional digits. Raw balances are split
//! into whole and fractional parts in `U256` before conversion, so an 18-decimal token
//! balance never has to fit the mantissa as a raw integer.

use ethers::types::U256;
use log::warn;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Largest scale `Decimal` can represent.
const MAX_SCALE: u32 = 28;
/// 10^77 is the largest power of ten that fits a U256.
const MAX_U256_EXP10: u8 = 77;

/// Normalize a base-unit amount (U256) into human-decimal Decimal using token decimals.
///
/// Fractional digits beyond 28 are truncated. Amounts whose whole part exceeds
/// `Decimal::MAX` saturate.
pub fn normalize_amount(amount: U256, decimals: u8) -> Decimal {
    if decimals > MAX_U256_EXP10 {
        warn!("Token decimals {} out of range, treating amount as zero", decimals);
        return Decimal::ZERO;
    }

    let scale = U256::exp10(decimals as usize);
    let whole = amount / scale;
    let frac = amount % scale;

    let whole_dec = match Decimal::from_str(&whole.to_string()) {
        Ok(d) => d,
        Err(_) => {
            warn!("Amount {} exceeds Decimal range, saturating", amount);
            return Decimal::MAX;
        }
    };

    whole_dec
        .checked_add(fraction_to_decimal(frac, decimals))
        .unwrap_or(Decimal::MAX)
}

fn fraction_to_decimal(frac: U256, decimals: u8) -> Decimal {
    if frac.is_zero() {
        return Decimal::ZERO;
    }
    let decimals = decimals as u32;
    let (frac, scale) = if decimals > MAX_SCALE {
        (frac / U256::exp10((decimals - MAX_SCALE) as usize), MAX_SCALE)
    } else {
        (frac, decimals)
    };
    // frac < 10^28 here, which fits both u128 and the 96-bit mantissa
    Decimal::try_from_i128_with_scale(frac.low_u128() as i128, scale).unwrap_or(Decimal::ZERO)
}

/// Converts a feed price into a `Decimal`. Non-finite or negative prices are treated as zero.
pub fn price_to_decimal(price: f64) -> Decimal {
    if !price.is_finite() || price < 0.0 {
        warn!("Ignoring invalid feed price {}", price);
        return Decimal::ZERO;
    }
    Decimal::from_f64(price).unwrap_or(Decimal::ZERO)
}

/// `normalize_amount(balance) * price`, saturating on overflow.
pub fn usd_value(balance: U256, decimals: u8, price: f64) -> Decimal {
    let price = price_to_decimal(price);
    if price.is_zero() {
        return Decimal::ZERO;
    }
    match normalize_amount(balance, decimals).checked_mul(price) {
        Some(value) => value,
        None => {
            warn!("USD value of {} at price {} overflowed, saturating", balance, price);
            Decimal::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_six_decimals() {
        assert_eq!(normalize_amount(U256::from(1_000_000u64), 6), Decimal::ONE);
        assert_eq!(
            normalize_amount(U256::from(1_500_000u64), 6),
            Decimal::new(15, 1)
        );
    }

    #[test]
    fn test_normalize_large_eighteen_decimal_balance() {
        // 123456789.123456789 tokens, 18 decimals
        let raw = U256::from_dec_str("123456789123456789000000000").unwrap();
        let expected = Decimal::from_str("123456789.123456789").unwrap();
        assert_eq!(normalize_amount(raw, 18), expected);
    }

    #[test]
    fn test_normalize_truncates_beyond_max_scale() {
        // 1 unit of a 30-decimal token is below Decimal precision
        assert_eq!(normalize_amount(U256::one(), 30), Decimal::ZERO);
        let raw = U256::exp10(30) + U256::exp10(2);
        assert_eq!(
            normalize_amount(raw, 30),
            Decimal::from_str("1.0000000000000000000000000001").unwrap()
        );
    }

    #[test]
    fn test_normalize_saturates_huge_amounts() {
        assert_eq!(normalize_amount(U256::MAX, 0), Decimal::MAX);
    }

    #[test]
    fn test_usd_value() {
        let tvl = usd_value(U256::from(1_000_000u64), 6, 2.5);
        assert_eq!(tvl, Decimal::new(25, 1));
        assert_eq!(usd_value(U256::from(1_000_000u64), 6, 0.0), Decimal::ZERO);
    }

    #[test]
    fn test_invalid_prices_are_zero() {
        assert_eq!(price_to_decimal(f64::NAN), Decimal::ZERO);
        assert_eq!(price_to_decimal(-1.0), Decimal::ZERO);
        assert_eq!(price_to_decimal(f64::INFINITY), Decimal::ZERO);
    }
}
