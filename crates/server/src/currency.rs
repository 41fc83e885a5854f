//! HTTP exchange-rate client backing the currency conversion port.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use expensio_core::config::CurrencyConfig;
use expensio_core::currency::{Conversion, ConversionError, CurrencyConverter};
use expensio_workflow::cache::exchange_rate_key;
use expensio_workflow::ReadThrough;

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    base: String,
    #[serde(default)]
    date: String,
    rates: HashMap<String, f64>,
}

/// Looks up `GET {api_url}/{from}` and reads `rates[to]`. Rates are cached per
/// currency pair; a cache outage only costs an extra upstream call.
pub struct ExchangeRateApiConverter {
    client: Client,
    api_url: String,
    api_key: Option<SecretString>,
    cache: ReadThrough,
    ttl: Duration,
}

impl ExchangeRateApiConverter {
    pub fn new(
        config: &CurrencyConfig,
        cache: ReadThrough,
        ttl: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            cache,
            ttl,
        })
    }

    async fn rate(&self, from: &str, to: &str) -> Result<Decimal, ConversionError> {
        let key = exchange_rate_key(from, to);
        if let Some(rate) = self.cache.get_json::<Decimal>(&key).await {
            return Ok(rate);
        }

        let url = format!("{}/{from}", self.api_url);
        let mut request = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| ConversionError::Upstream(format!("failed to fetch exchange rate: {error}")))?;
        if !response.status().is_success() {
            warn!(
                event_name = "currency.upstream_status",
                status = response.status().as_u16(),
                from,
                "exchange rate api returned an error status"
            );
            return Err(ConversionError::Upstream(format!(
                "exchange rate API returned status: {}",
                response.status().as_u16()
            )));
        }

        let body: RatesResponse = response.json().await.map_err(|error| {
            ConversionError::Upstream(format!("failed to parse exchange rate response: {error}"))
        })?;
        debug!(event_name = "currency.rates_fetched", base = %body.base, date = %body.date, "rates fetched");

        let rate = body
            .rates
            .get(to)
            .copied()
            .and_then(Decimal::from_f64)
            .ok_or_else(|| ConversionError::RateUnavailable { from: from.to_string(), to: to.to_string() })?;

        self.cache.put_json(&key, &rate, self.ttl).await;
        Ok(rate)
    }
}

#[async_trait]
impl CurrencyConverter for ExchangeRateApiConverter {
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Conversion, ConversionError> {
        let from = from.trim().to_ascii_uppercase();
        let to = to.trim().to_ascii_uppercase();
        if from == to {
            return Ok(Conversion::identity(amount));
        }

        let rate = self.rate(&from, &to).await?;
        Ok(Conversion { converted_amount: (amount * rate).round_dp(2), rate })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use expensio_core::cache::InMemoryCache;
    use expensio_core::config::AppConfig;
    use expensio_core::currency::{ConversionError, CurrencyConverter};
    use expensio_workflow::ReadThrough;

    use super::ExchangeRateApiConverter;

    fn converter(server: &MockServer) -> ExchangeRateApiConverter {
        let mut config = AppConfig::default().currency;
        config.api_url = format!("{}/v4/latest", server.uri());
        ExchangeRateApiConverter::new(
            &config,
            ReadThrough::new(Arc::new(InMemoryCache::new())),
            Duration::from_secs(60),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn converts_with_upstream_rate_and_caches_it() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/latest/EUR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "base": "EUR",
                "date": "2026-10-01",
                "rates": { "USD": 1.25, "GBP": 0.86 }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let converter = converter(&server);

        let first = converter.convert(Decimal::from(80), "eur", "USD").await.expect("convert");
        let second = converter.convert(Decimal::from(10), "EUR", "USD").await.expect("cached convert");

        assert_eq!(first.converted_amount, Decimal::from(100));
        assert_eq!(first.rate, Decimal::from_str("1.25").expect("decimal"));
        assert_eq!(second.converted_amount, Decimal::from_str("12.50").expect("decimal"));
    }

    #[tokio::test]
    async fn same_currency_skips_the_network() {
        let server = MockServer::start().await;
        let converter = converter(&server);

        let conversion = converter.convert(Decimal::from(42), "USD", "usd").await.expect("convert");

        assert_eq!(conversion.rate, Decimal::ONE);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_and_missing_rates_surface_as_conversion_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/latest/GBP"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v4/latest/EUR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rates": { "USD": 1.1 } })))
            .mount(&server)
            .await;
        let converter = converter(&server);

        let unavailable = converter.convert(Decimal::ONE, "GBP", "USD").await;
        assert!(matches!(unavailable, Err(ConversionError::Upstream(message)) if message.contains("503")));

        let missing = converter.convert(Decimal::ONE, "EUR", "JPY").await;
        assert!(matches!(missing, Err(ConversionError::RateUnavailable { .. })));
    }
}
