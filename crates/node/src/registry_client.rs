//! HTTP client for the registry RPC surface

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use weftnet_common::wire::{
    BootstrapReply, CertificateReply, CertificateRequest, DeclareReply, DeclareRequest,
    PeerEntry, PeerListReply, TokenRequest,
};
use weftnet_common::{Error, Result};

#[derive(Clone)]
pub struct RegistryClient {
    base: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Registry(format!("{}: {}", status, body)))
    }

    pub async fn request_token(&self, email: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/token"))
            .json(&TokenRequest {
                email: email.to_string(),
            })
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn request_certificate(&self, token: &str, csr_pem: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/certificate"))
            .json(&CertificateRequest {
                token: token.to_string(),
                csr_pem: csr_pem.to_string(),
            })
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        let reply: CertificateReply = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(reply.cert_pem)
    }

    pub async fn get_ca(&self) -> Result<String> {
        let resp = self
            .http
            .get(self.url("/ca"))
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        Self::check(resp)
            .await?
            .text()
            .await
            .map_err(|e| Error::Registry(e.to_string()))
    }

    pub async fn declare(&self, address: &str) -> Result<bool> {
        let resp = self
            .http
            .post(self.url("/declare"))
            .json(&DeclareRequest {
                address: address.to_string(),
            })
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        let reply: DeclareReply = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(reply.registered)
    }

    pub async fn get_peer_list(&self, n: usize) -> Result<Vec<PeerEntry>> {
        let resp = self
            .http
            .get(self.url("/peers"))
            .query(&[("n", n)])
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        let reply: PeerListReply = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(reply.peers)
    }

    pub async fn get_bootstrap_peer(&self, prefix: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url("/bootstrap"))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        let reply: BootstrapReply = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;
        BASE64
            .decode(reply.blob)
            .map_err(|e| Error::Registry(format!("bad bootstrap blob: {}", e)))
    }
}
