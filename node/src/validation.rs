use crate::config::ValidationHookConfig;
use crate::error::{ Error, Result };
use reqwest::header::{ HeaderMap, HeaderName, HeaderValue };
use shared::validation::{ ValidationRequest, ValidationResponse };
use std::time::Duration;
use tracing::{ info, warn };

/// Client for the operator's signing-approval endpoint. This is a policy
/// gate and fails closed: a transport error, a non-200 response or an
/// unparsable body all reject the signing, only an explicit
/// `{"approved": true}` lets it proceed.
pub struct ValidationClient {
    client: reqwest::Client,
    url: String,
}

impl ValidationClient {
    pub fn new(config: &ValidationHookConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                Error::invalid(format!("invalid validation hook header name {}: {}", name, err))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                Error::invalid(format!("invalid validation hook header value: {}", err))
            })?;
            headers.insert(name, value);
        }
        let client = reqwest::Client
            ::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|err| Error::Transport(format!("validation hook client: {}", err)))?;
        Ok(Self { client, url: config.url.clone() })
    }

    pub async fn validate(&self, request: &ValidationRequest) -> Result<()> {
        let response = self.client
            .post(&self.url)
            .json(request)
            .send().await
            .map_err(|err| {
                warn!("Validation hook unreachable: {}", err);
                Error::ValidationRejected(format!("hook unreachable: {}", err))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ValidationRejected(format!("hook returned status {}", status)));
        }
        let verdict: ValidationResponse = response
            .json().await
            .map_err(|err| Error::ValidationRejected(format!("unparsable hook response: {}", err)))?;
        if verdict.approved {
            info!("Validation hook approved signing of key {}", request.key_id);
            Ok(())
        } else {
            Err(
                Error::ValidationRejected(
                    verdict.reason.unwrap_or_else(|| "denied by policy".to_string())
                )
            )
        }
    }
}
