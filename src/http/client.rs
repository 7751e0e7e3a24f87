use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::{Client, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{NegotiationRequest, NegotiationResponse, RequestKind};
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease};

const NEGOTIATE_PATH: &str = "/";
const LEASES_PATH: &str = "/leases";

/// Client for the HTTP transport.
#[derive(Clone)]
pub struct HttpNegotiationClient {
    client: Client,
    base_url: Url,
}

impl HttpNegotiationClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub async fn discover(&self, client_id: &ClientId) -> Result<NegotiationResponse> {
        self.negotiate(RequestKind::Discover, client_id, None).await
    }

    pub async fn request(
        &self,
        client_id: &ClientId,
        address: Ipv4Addr,
    ) -> Result<NegotiationResponse> {
        self.negotiate(RequestKind::Request, client_id, Some(address))
            .await
    }

    pub async fn release(
        &self,
        client_id: &ClientId,
        address: Ipv4Addr,
    ) -> Result<NegotiationResponse> {
        self.negotiate(RequestKind::Release, client_id, Some(address))
            .await
    }

    pub async fn leases(&self) -> Result<Vec<Lease>> {
        let url = self.url(LEASES_PATH)?;
        let resp = self.client.get(url).send().await?;
        Self::decode_response(resp).await
    }

    async fn negotiate(
        &self,
        kind: RequestKind,
        client_id: &ClientId,
        requested_address: Option<Ipv4Addr>,
    ) -> Result<NegotiationResponse> {
        let request = NegotiationRequest {
            kind,
            client_id: client_id.clone(),
            requested_address,
        };
        self.post(NEGOTIATE_PATH, &request).await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        let resp = self.client.post(url).json(body).send().await?;
        Self::decode_response(resp).await
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| Error::InvalidConfig(format!("invalid server URL: {}", err)))
    }

    async fn decode_response<T>(resp: Response) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json::<T>().await?)
        } else {
            let reason = resp
                .text()
                .await
                .unwrap_or_else(|err| format!("response body error: {err}"));
            Err(Error::NegotiationFailed(format!("{status}: {reason}")))
        }
    }
}
