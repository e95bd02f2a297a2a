//! Kraken REST API client.

use crate::config::KrakenConfig;
use crate::coordination::SequenceCoordinator;
use crate::error::{Result, RotatorError};
use crate::exchange::traits::ExchangeApi;
use crate::exchange::types::*;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const TICKER_PATH: &str = "/0/public/Ticker";
const BALANCE_PATH: &str = "/0/private/Balance";
const ADD_ORDER_PATH: &str = "/0/private/AddOrder";

/// Exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &KrakenConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// What a failed attempt tells us about the request's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// The exchange did not act on the request
    Refused,
    /// No usable answer; an order may or may not have executed
    Unknown,
    /// The exchange reported a temporary service problem
    Busy,
    Final,
}

#[derive(Debug)]
struct AttemptError {
    error: RotatorError,
    disposition: Disposition,
}

impl AttemptError {
    fn new(disposition: Disposition, error: RotatorError) -> Self {
        Self { error, disposition }
    }
}

impl From<RotatorError> for AttemptError {
    fn from(error: RotatorError) -> Self {
        Self::new(Disposition::Final, error)
    }
}

/// Kraken spot API client: public market data and signed private calls.
pub struct KrakenClient {
    http: Client,
    base_url: String,
    api_key: String,
    secret: Vec<u8>,
    sequence: SequenceCoordinator,
    retry: RetryPolicy,
}

impl KrakenClient {
    /// Create a new Kraken client from configuration.
    ///
    /// Every private request draws its sequence value from `sequence`, which
    /// must be shared by all processes using the same credentials.
    pub fn new(config: &KrakenConfig, sequence: SequenceCoordinator) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| {
                RotatorError::ExchangeUnavailable(format!("failed to create HTTP client: {e}"))
            })?;

        let secret = STANDARD
            .decode(config.secret_key.trim())
            .map_err(|e| RotatorError::Signing(format!("secret key is not valid base64: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret,
            sequence,
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Draw a fresh sequence value without blocking the runtime on the file lock.
    async fn next_nonce(&self) -> Result<u64> {
        let sequence = self.sequence.clone();
        tokio::task::spawn_blocking(move || sequence.next_sequence())
            .await
            .map_err(|e| RotatorError::Io(std::io::Error::other(e)))?
    }

    /// Run one logical request with retries.
    ///
    /// `idempotent` requests retry on any transient failure. Others retry only
    /// when the exchange certainly did not act, and an unknown outcome becomes
    /// `OrderUnconfirmed`.
    async fn execute<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        private: bool,
        idempotent: bool,
    ) -> Result<T> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = if private {
                self.private_attempt(path, params).await
            } else {
                self.public_attempt(path, params).await
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let retryable = match failure.disposition {
                Disposition::Refused => true,
                Disposition::Unknown | Disposition::Busy => idempotent,
                Disposition::Final => false,
            };

            if !retryable || attempt >= self.retry.max_attempts {
                if !idempotent && failure.disposition == Disposition::Unknown {
                    return Err(RotatorError::OrderUnconfirmed(failure.error.to_string()));
                }
                return Err(failure.error);
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                path,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "Request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn public_attempt<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<T, AttemptError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(transport_error)?;

        read_envelope(response).await
    }

    async fn private_attempt<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<T, AttemptError> {
        if self.api_key.is_empty() || self.secret.is_empty() {
            return Err(RotatorError::Signing("API credentials not configured".to_string()).into());
        }

        let nonce = self.next_nonce().await?;
        let postdata = encode_form(nonce, params);
        let signature = sign_request(&self.secret, path, nonce, &postdata)?;

        debug!(path, nonce, "Sending private request");

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await
            .map_err(transport_error)?;

        read_envelope(response).await
    }
}

#[async_trait]
impl ExchangeApi for KrakenClient {
    #[instrument(skip(self))]
    async fn ticker(&self, pair: &str) -> Result<PriceQuote> {
        let result: HashMap<String, TickerInfo> = self
            .execute(TICKER_PATH, &[("pair", pair.to_string())], false, true)
            .await?;

        // Kraken keys the result by its internal pair name (e.g. XXBTZUSD)
        let info = result
            .into_values()
            .next()
            .ok_or_else(|| RotatorError::ExchangeUnavailable(format!("no ticker data for {pair}")))?;

        let last = info
            .c
            .first()
            .and_then(|p| p.parse::<Decimal>().ok())
            .ok_or_else(|| {
                RotatorError::ExchangeUnavailable(format!("ticker for {pair} has no last trade price"))
            })?;

        Ok(PriceQuote {
            pair: pair.to_string(),
            last,
            open_24h: info.o,
            fetched_at: Utc::now(),
        })
    }

    #[instrument(skip(self))]
    async fn balances(&self) -> Result<BalanceSnapshot> {
        let raw: HashMap<String, Decimal> = self.execute(BALANCE_PATH, &[], true, true).await?;
        debug!(keys = raw.len(), "Fetched balances");
        Ok(BalanceSnapshot::new(raw))
    }

    #[instrument(skip(self))]
    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck> {
        let params = [
            ("ordertype", "market".to_string()),
            ("pair", order.pair.clone()),
            ("type", order.side.as_str().to_string()),
            ("volume", order.volume_str()),
        ];

        let result: AddOrderResult = self.execute(ADD_ORDER_PATH, &params, true, false).await?;
        let ack = OrderAck::from(result);

        info!(
            pair = %order.pair,
            side = %order.side,
            volume = %order.volume_str(),
            txids = ?ack.txids,
            "Order accepted"
        );

        Ok(ack)
    }
}

/// `API-Sign` value: base64(HMAC-SHA512(secret, path || SHA256(nonce || postdata))).
pub fn sign_request(secret: &[u8], path: &str, nonce: u64, postdata: &str) -> Result<String> {
    let mut sha = Sha256::new();
    sha.update(nonce.to_string().as_bytes());
    sha.update(postdata.as_bytes());
    let digest = sha.finalize();

    let mut mac = Hmac::<Sha512>::new_from_slice(secret)
        .map_err(|e| RotatorError::Signing(e.to_string()))?;
    mac.update(path.as_bytes());
    mac.update(&digest);

    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Form body with the sequence value first, as Kraken expects.
fn encode_form(nonce: u64, params: &[(&str, String)]) -> String {
    std::iter::once(format!("nonce={}", nonce))
        .chain(
            params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v))),
        )
        .collect::<Vec<_>>()
        .join("&")
}

fn transport_error(e: reqwest::Error) -> AttemptError {
    if e.is_connect() {
        // Never reached the exchange
        AttemptError::new(
            Disposition::Refused,
            RotatorError::ExchangeUnavailable(format!("connection failed: {e}")),
        )
    } else if e.is_timeout() {
        AttemptError::new(
            Disposition::Unknown,
            RotatorError::ExchangeUnavailable(format!("request timed out: {e}")),
        )
    } else {
        AttemptError::new(
            Disposition::Unknown,
            RotatorError::ExchangeUnavailable(e.to_string()),
        )
    }
}

async fn read_envelope<T: DeserializeOwned>(response: Response) -> std::result::Result<T, AttemptError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AttemptError::new(
            Disposition::Refused,
            RotatorError::RateLimited(format!("HTTP {status}")),
        ));
    }

    let body = response.text().await.map_err(|e| {
        AttemptError::new(
            Disposition::Unknown,
            RotatorError::ExchangeUnavailable(format!("failed to read response body: {e}")),
        )
    })?;

    if status.is_server_error() {
        return Err(AttemptError::new(
            Disposition::Unknown,
            RotatorError::ExchangeUnavailable(format!("HTTP {status}: {body}")),
        ));
    }

    if !status.is_success() {
        return Err(AttemptError::new(
            Disposition::Final,
            RotatorError::ExchangeRejected(vec![format!("HTTP {status}: {body}")]),
        ));
    }

    let envelope: KrakenResponse<T> = serde_json::from_str(&body).map_err(|e| {
        AttemptError::new(
            Disposition::Unknown,
            RotatorError::ExchangeUnavailable(format!("malformed response: {e}")),
        )
    })?;

    if !envelope.error.is_empty() {
        return Err(classify_envelope_errors(envelope.error));
    }

    envelope.result.ok_or_else(|| {
        AttemptError::new(
            Disposition::Unknown,
            RotatorError::ExchangeUnavailable("response carried neither result nor error".to_string()),
        )
    })
}

fn classify_envelope_errors(errors: Vec<String>) -> AttemptError {
    let mentions = |needle: &str| errors.iter().any(|e| e.to_ascii_lowercase().contains(needle));

    if mentions("rate limit") || mentions("too many requests") {
        AttemptError::new(Disposition::Refused, RotatorError::RateLimited(errors.join(", ")))
    } else if mentions("invalid nonce") {
        AttemptError::new(Disposition::Refused, RotatorError::ExchangeRejected(errors))
    } else if mentions("eservice:unavailable") || mentions("eservice:busy") {
        AttemptError::new(
            Disposition::Busy,
            RotatorError::ExchangeUnavailable(errors.join(", ")),
        )
    } else {
        AttemptError::new(Disposition::Final, RotatorError::ExchangeRejected(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::path::PathBuf;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Published Kraken signing example
    const DOC_SECRET: &str =
        "kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==";

    // ===== Test Helpers =====

    fn temp_sequence_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("rotator_client_{}", uuid::Uuid::new_v4()))
            .join("nonce.txt")
    }

    fn test_client(server: &MockServer) -> KrakenClient {
        let config = KrakenConfig {
            api_key: "test-key".to_string(),
            secret_key: DOC_SECRET.to_string(),
            base_url: server.uri(),
            request_timeout_secs: 5,
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..KrakenConfig::default()
        };
        let sequence = SequenceCoordinator::new(temp_sequence_file(), Duration::from_secs(2));
        KrakenClient::new(&config, sequence).unwrap()
    }

    fn nonce_of(body: &[u8]) -> u64 {
        let body = std::str::from_utf8(body).unwrap();
        body.split('&')
            .find_map(|kv| kv.strip_prefix("nonce="))
            .unwrap()
            .parse()
            .unwrap()
    }

    fn ticker_body() -> serde_json::Value {
        serde_json::json!({
            "error": [],
            "result": {
                "XXBTZUSD": {
                    "c": ["96.90000", "0.01"],
                    "o": "100.00000"
                }
            }
        })
    }

    // ===== Signing =====

    #[test]
    fn test_sign_request_matches_published_vector() {
        let secret = STANDARD.decode(DOC_SECRET).unwrap();
        let postdata =
            "nonce=1616492376594&ordertype=limit&pair=XBTUSD&price=37500&type=buy&volume=1.25";

        let signature = sign_request(&secret, ADD_ORDER_PATH, 1616492376594, postdata).unwrap();

        assert_eq!(
            signature,
            "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ=="
        );
    }

    #[test]
    fn test_encode_form_puts_nonce_first() {
        let params = [("pair", "XBTUSD".to_string()), ("volume", "0.5".to_string())];
        assert_eq!(encode_form(42, &params), "nonce=42&pair=XBTUSD&volume=0.5");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
        assert_eq!(policy.backoff(10), Duration::from_millis(1500));
    }

    #[test]
    fn test_envelope_classification() {
        let rate = classify_envelope_errors(vec!["EAPI:Rate limit exceeded".into()]);
        assert_eq!(rate.disposition, Disposition::Refused);
        assert!(matches!(rate.error, RotatorError::RateLimited(_)));

        let busy = classify_envelope_errors(vec!["EService:Unavailable".into()]);
        assert_eq!(busy.disposition, Disposition::Busy);

        let funds = classify_envelope_errors(vec!["EOrder:Insufficient funds".into()]);
        assert_eq!(funds.disposition, Disposition::Final);
        assert!(matches!(funds.error, RotatorError::ExchangeRejected(_)));
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let config = KrakenConfig {
            secret_key: "not base64!!".to_string(),
            ..KrakenConfig::default()
        };
        let sequence = SequenceCoordinator::new(temp_sequence_file(), Duration::from_secs(1));
        assert!(matches!(
            KrakenClient::new(&config, sequence),
            Err(RotatorError::Signing(_))
        ));
    }

    // ===== Public =====

    #[tokio::test]
    async fn test_ticker_parses_last_and_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TICKER_PATH))
            .and(query_param("pair", "XBTUSD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ticker_body()))
            .mount(&server)
            .await;

        let quote = test_client(&server).ticker("XBTUSD").await.unwrap();

        assert_eq!(quote.pair, "XBTUSD");
        assert_eq!(quote.last, dec!(96.9));
        assert_eq!(quote.open_24h, dec!(100));
        assert_eq!(quote.change_24h_pct(), dec!(-3.1));
    }

    #[tokio::test]
    async fn test_ticker_retries_after_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TICKER_PATH))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(TICKER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(ticker_body()))
            .mount(&server)
            .await;

        let quote = test_client(&server).ticker("XBTUSD").await.unwrap();
        assert_eq!(quote.last, dec!(96.9));
    }

    #[tokio::test]
    async fn test_ticker_exhausted_rate_limit_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TICKER_PATH))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = test_client(&server).ticker("XBTUSD").await.unwrap_err();
        assert!(matches!(err, RotatorError::RateLimited(_)));
    }

    // ===== Private =====

    #[tokio::test]
    async fn test_balances_are_signed_and_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BALANCE_PATH))
            .and(header("API-Key", "test-key"))
            .and(header_exists("API-Sign"))
            .and(body_string_contains("nonce="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": [],
                "result": { "XXBT": "0.50000000", "ZUSD": "80.0000" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let balances = test_client(&server).balances().await.unwrap();
        assert_eq!(balances.get("XXBT"), dec!(0.5));
        assert_eq!(balances.get("ZUSD"), dec!(80));
    }

    #[tokio::test]
    async fn test_balance_retry_uses_fresh_nonce() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BALANCE_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(BALANCE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": [],
                "result": { "ZUSD": "10" }
            })))
            .mount(&server)
            .await;

        test_client(&server).balances().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(nonce_of(&requests[1].body) > nonce_of(&requests[0].body));
    }

    #[tokio::test]
    async fn test_balance_server_errors_exhaust_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BALANCE_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .expect(3)
            .mount(&server)
            .await;

        let err = test_client(&server).balances().await.unwrap_err();

        assert!(matches!(err, RotatorError::ExchangeUnavailable(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_order_not_retried_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ADD_ORDER_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let order = MarketOrder::new("XBTUSD", OrderSide::Buy, dec!(0.5));
        let err = test_client(&server).place_market_order(&order).await.unwrap_err();
        assert!(matches!(err, RotatorError::OrderUnconfirmed(_)));
    }

    #[tokio::test]
    async fn test_order_rejection_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ADD_ORDER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": ["EOrder:Insufficient funds"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let order = MarketOrder::new("XBTUSD", OrderSide::Buy, dec!(0.5));
        let err = test_client(&server).place_market_order(&order).await.unwrap_err();
        match err {
            RotatorError::ExchangeRejected(errors) => {
                assert_eq!(errors, vec!["EOrder:Insufficient funds"])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_order_retried_when_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ADD_ORDER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": ["EOrder:Rate limit exceeded"]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(ADD_ORDER_PATH))
            .and(body_string_contains("ordertype=market"))
            .and(body_string_contains("type=sell"))
            .and(body_string_contains("volume=0.25000000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": [],
                "result": {
                    "descr": { "order": "sell 0.25000000 XBTUSD @ market" },
                    "txid": ["OABC12-DEF34-GHI567"]
                }
            })))
            .mount(&server)
            .await;

        let order = MarketOrder::new("XBTUSD", OrderSide::Sell, dec!(0.25));
        let ack = test_client(&server).place_market_order(&order).await.unwrap();
        assert_eq!(ack.txids, vec!["OABC12-DEF34-GHI567"]);
    }

    #[tokio::test]
    async fn test_private_call_without_credentials_fails_fast() {
        let server = MockServer::start().await;
        let config = KrakenConfig {
            base_url: server.uri(),
            ..KrakenConfig::default()
        };
        let sequence = SequenceCoordinator::new(temp_sequence_file(), Duration::from_secs(1));
        let client = KrakenClient::new(&config, sequence).unwrap();

        assert!(matches!(client.balances().await, Err(RotatorError::Signing(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
