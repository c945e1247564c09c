// ===============================
// src/risk.rs
// ===============================
//
// Pre-trade checks on an entry intent: quantity from the quote budget,
// then the notional cap.
//
use thiserror::Error;

use crate::config::Sizing;

const QTY_DECIMALS: i32 = 6;

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("no valid entry price ({0})")]
    Price(f64),
    #[error("notional {notional:.2} exceeds limit {limit:.2}")]
    Notional { notional: f64, limit: f64 },
    #[error("quantity rounds to zero at price {0}")]
    ZeroQty(f64),
}

/// Quantity for one entry: SIZE_QUOTE / price, floored to 6 decimals.
pub fn size_entry(s: &Sizing, price: f64) -> Result<f64, RiskError> {
    if !(price.is_finite() && price > 0.0) {
        return Err(RiskError::Price(price));
    }
    let scale = 10f64.powi(QTY_DECIMALS);
    let qty = (s.size_quote / price * scale).floor() / scale;
    if qty <= 0.0 {
        return Err(RiskError::ZeroQty(price));
    }
    let notional = qty * price;
    if notional > s.max_notional {
        return Err(RiskError::Notional { notional, limit: s.max_notional });
    }
    Ok(qty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing(size_quote: f64, max_notional: f64) -> Sizing { Sizing { size_quote, max_notional } }

    #[test]
    fn quantity_is_floored_not_rounded() {
        // 20 / 30000 = 0.000666..
        assert_eq!(size_entry(&sizing(20.0, 1000.0), 30_000.0), Ok(0.000666));
        assert_eq!(size_entry(&sizing(20.0, 1000.0), 100.0), Ok(0.2));
    }

    #[test]
    fn rejects_bad_price_dust_and_oversize() {
        assert_eq!(size_entry(&sizing(20.0, 1000.0), 0.0), Err(RiskError::Price(0.0)));
        assert!(matches!(size_entry(&sizing(20.0, 1000.0), f64::NAN), Err(RiskError::Price(_))));
        assert_eq!(size_entry(&sizing(0.00001, 1000.0), 100.0), Err(RiskError::ZeroQty(100.0)));
        assert!(matches!(size_entry(&sizing(2000.0, 1000.0), 100.0), Err(RiskError::Notional { .. })));
    }
}
