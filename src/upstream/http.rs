use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use super::{FunctionCode, Transport};
use crate::error::{Error, Result, UpstreamError};
use crate::fetch::{HttpClient, fetch_bytes};

/// [`Transport`] over the public HTTP endpoint: `GET {base}?func=..&dato=..`.
pub struct HttpTransport<C> {
    client: C,
    base_url: Url,
}

impl<C: HttpClient> HttpTransport<C> {
    pub fn new(client: C, base_url: &str) -> Result<Self> {
        let base_url = base_url
            .parse()
            .map_err(|e| Error::Config(format!("base url '{base_url}': {e}")))?;
        Ok(Self { client, base_url })
    }

    fn url_for(&self, function: FunctionCode, parameter: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("func", &function.code().to_string())
            .append_pair("dato", parameter);
        url
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    #[tracing::instrument(skip(self), fields(function = %function))]
    async fn query(&self, function: FunctionCode, parameter: &str) -> Result<Value> {
        let url = self.url_for(function, parameter);
        let (status, body) = fetch_bytes(&self.client, url)
            .await
            .map_err(classify_request_error)?;

        debug!(status = status.as_u16(), bytes = body.len(), "Upstream responded");
        check_status(function, status)?;

        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(UpstreamError::Unavailable("empty response body".into()).into());
        }
        serde_json::from_slice(&body).map_err(|e| Error::malformed(function, e))
    }
}

fn classify_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        UpstreamError::Unavailable(e.to_string()).into()
    } else {
        Error::Request(e)
    }
}

fn check_status(function: FunctionCode, status: StatusCode) -> Result<()> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(UpstreamError::RateLimited(status.to_string()).into());
    }
    if status.is_server_error() {
        return Err(UpstreamError::Unavailable(status.to_string()).into());
    }
    if !status.is_success() {
        return Err(Error::Rejected {
            function,
            status: status.as_u16(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverCalled;

    #[async_trait]
    impl HttpClient for NeverCalled {
        async fn execute(&self, _req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
            unreachable!("url construction only")
        }
    }

    #[test]
    fn test_url_carries_function_and_parameter() {
        let transport = HttpTransport::new(NeverCalled, "https://example.org/queryitr_v3.php").unwrap();
        let url = transport.url_for(FunctionCode::LineBuses, "1800");
        assert_eq!(url.as_str(), "https://example.org/queryitr_v3.php?func=2&dato=1800");
    }

    #[test]
    fn test_bad_base_url_is_a_config_error() {
        let err = HttpTransport::new(NeverCalled, "itranvias.com/queryitr_v3.php").err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_status_classification() {
        let f = FunctionCode::StopArrivals;
        assert!(check_status(f, StatusCode::OK).is_ok());
        assert!(check_status(f, StatusCode::TOO_MANY_REQUESTS).unwrap_err().is_rate_limit());

        let outage = check_status(f, StatusCode::BAD_GATEWAY).unwrap_err();
        assert!(outage.is_transient() && !outage.is_rate_limit());

        let rejected = check_status(f, StatusCode::NOT_FOUND).unwrap_err();
        assert!(matches!(rejected, Error::Rejected { status: 404, .. }));
    }
}
