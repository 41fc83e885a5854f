use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of converting an amount into another currency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub converted_amount: Decimal,
    pub rate: Decimal,
}

impl Conversion {
    pub fn identity(amount: Decimal) -> Self {
        Self { converted_amount: amount, rate: Decimal::ONE }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("exchange rate for {from}->{to} is not available")]
    RateUnavailable { from: String, to: String },
    #[error("exchange rate service failed: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait CurrencyConverter: Send + Sync {
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Conversion, ConversionError>;
}

/// Converts with a fixed table of rates. Missing pairs fail.
#[derive(Clone, Debug, Default)]
pub struct StaticRateConverter {
    rates: HashMap<(String, String), Decimal>,
}

impl StaticRateConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates.insert((from.to_ascii_uppercase(), to.to_ascii_uppercase()), rate);
        self
    }
}

#[async_trait]
impl CurrencyConverter for StaticRateConverter {
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Conversion, ConversionError> {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();
        if from == to {
            return Ok(Conversion::identity(amount));
        }

        let rate = self
            .rates
            .get(&(from.clone(), to.clone()))
            .copied()
            .ok_or(ConversionError::RateUnavailable { from, to })?;
        Ok(Conversion { converted_amount: (amount * rate).round_dp(2), rate })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{ConversionError, CurrencyConverter, StaticRateConverter};

    #[tokio::test]
    async fn same_currency_is_identity_and_unknown_pairs_fail() {
        let converter = StaticRateConverter::new().with_rate("eur", "usd", Decimal::new(108, 2));

        let same = converter.convert(Decimal::from(5), "USD", "usd").await.expect("identity");
        assert_eq!(same.rate, Decimal::ONE);

        let eur = converter.convert(Decimal::from(100), "EUR", "USD").await.expect("convert");
        assert_eq!(eur.converted_amount, Decimal::new(10_800, 2));

        let missing = converter.convert(Decimal::from(1), "GBP", "USD").await;
        assert!(matches!(missing, Err(ConversionError::RateUnavailable { .. })));
    }
}
