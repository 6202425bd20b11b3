use std::time::Duration;

use async_trait::async_trait;
use keyfleet_types::{
    BundleUpdate, DepositRequest, DepositResponse, ErrorResponse, EscrowAdvertisement,
    EscrowStatus, ShareRequest, ShareResponse,
};
use reqwest::{Client, Response};
use tracing::{debug, error};

use super::EscrowEndpoint;
use crate::error::{TrustError, TrustResult};

/// How the coordinator reaches escrow endpoints.
#[async_trait]
pub trait EscrowTransport: Send + Sync {
    async fn advertisement(&self, endpoint: &EscrowEndpoint) -> TrustResult<EscrowAdvertisement>;

    async fn deposit(
        &self,
        endpoint: &EscrowEndpoint,
        request: &DepositRequest,
    ) -> TrustResult<DepositResponse>;

    async fn release(
        &self,
        endpoint: &EscrowEndpoint,
        request: &ShareRequest,
    ) -> TrustResult<ShareResponse>;
}

/// HTTP client for the escrow API
pub struct HttpEscrowClient {
    http: Client,
}

impl std::fmt::Debug for HttpEscrowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEscrowClient").finish_non_exhaustive()
    }
}

impl HttpEscrowClient {
    pub fn new(request_timeout: Duration) -> TrustResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TrustError::transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    fn url(endpoint: &EscrowEndpoint, path: &str) -> String {
        format!("{}{}", endpoint.url.trim_end_matches('/'), path)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        endpoint: &EscrowEndpoint,
        response: Response,
    ) -> TrustResult<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                error!(endpoint = %endpoint.id, "Failed to parse escrow response: {}", e);
                TrustError::transport(format!("malformed response from {}: {}", endpoint.id, e))
            });
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());

        if status.is_server_error() || status.as_u16() == 409 {
            Err(TrustError::transport(format!(
                "{} answered {}: {}",
                endpoint.id, status, message
            )))
        } else {
            Err(TrustError::invalid_request(format!(
                "{} rejected the request: {}",
                endpoint.id, message
            )))
        }
    }

    /// Push an operator-signed trust bundle to an endpoint.
    pub async fn push_bundle(
        &self,
        endpoint: &EscrowEndpoint,
        update: &BundleUpdate,
    ) -> TrustResult<EscrowStatus> {
        let response = self
            .http
            .put(Self::url(endpoint, "/v1/bundle"))
            .json(update)
            .send()
            .await
            .map_err(|e| Self::send_error(endpoint, e))?;
        Self::parse(endpoint, response).await
    }

    pub async fn status(&self, endpoint: &EscrowEndpoint) -> TrustResult<EscrowStatus> {
        let response = self
            .http
            .get(Self::url(endpoint, "/v1/status"))
            .send()
            .await
            .map_err(|e| Self::send_error(endpoint, e))?;
        Self::parse(endpoint, response).await
    }

    fn send_error(endpoint: &EscrowEndpoint, e: reqwest::Error) -> TrustError {
        debug!(endpoint = %endpoint.id, error = %e, "Escrow request failed");
        TrustError::transport(format!("{} unreachable: {}", endpoint.id, e))
    }
}

#[async_trait]
impl EscrowTransport for HttpEscrowClient {
    async fn advertisement(&self, endpoint: &EscrowEndpoint) -> TrustResult<EscrowAdvertisement> {
        let response = self
            .http
            .get(Self::url(endpoint, "/v1/adv"))
            .send()
            .await
            .map_err(|e| Self::send_error(endpoint, e))?;
        Self::parse(endpoint, response).await
    }

    async fn deposit(
        &self,
        endpoint: &EscrowEndpoint,
        request: &DepositRequest,
    ) -> TrustResult<DepositResponse> {
        let response = self
            .http
            .post(Self::url(endpoint, "/v1/deposit"))
            .json(request)
            .send()
            .await
            .map_err(|e| Self::send_error(endpoint, e))?;
        Self::parse(endpoint, response).await
    }

    async fn release(
        &self,
        endpoint: &EscrowEndpoint,
        request: &ShareRequest,
    ) -> TrustResult<ShareResponse> {
        let response = self
            .http
            .post(Self::url(endpoint, "/v1/release"))
            .json(request)
            .send()
            .await
            .map_err(|e| Self::send_error(endpoint, e))?;
        Self::parse(endpoint, response).await
    }
}
