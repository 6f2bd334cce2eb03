//! Azure block blob dialect.
//!
//! Speaks just enough of the blob REST surface to cover the capability set:
//! container listing, blob metadata, ranged reads, block staging
//! (`comp=block`), block-list commit (`comp=blocklist`), deletion, and
//! service-SAS temporary URLs. Requests are authorized with the account key
//! (Shared Key Lite).

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::status_error;
use crate::sign::{hmac_sha256, percent_encode};
use crate::xml::values_of;
use crate::{AuthInput, ObjectMeta, Transport, TransportError};

/// Storage REST API version sent with every request.
const API_VERSION: &str = "2021-08-06";

/// Azure block blob backend.
#[derive(Debug, Clone)]
pub struct AzureStore {
    client: Client,
    /// Account endpoint, e.g. `https://account.blob.core.windows.net`.
    endpoint: String,
    account: String,
    /// Decoded account key.
    key: Vec<u8>,
}

impl AzureStore {
    /// Builds a client for `endpoint` using the account name/key in `auth`.
    pub fn new(endpoint: &str, auth: &AuthInput) -> Result<Self, TransportError> {
        let key = BASE64
            .decode(auth.secret.as_bytes())
            .map_err(|e| TransportError::Auth(format!("account key is not base64: {e}")))?;
        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            account: auth.username.clone(),
            key,
        })
    }

    fn object_url(&self, container: &str, key: &str) -> String {
        format!("{}/{container}/{key}", self.endpoint)
    }

    fn now_rfc1123() -> String {
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    /// Shared Key Lite authorization header.
    ///
    /// String-to-sign: VERB, Content-MD5 (unused), Content-Type, Date
    /// (carried as x-ms-date instead), canonicalized x-ms headers, and the
    /// canonicalized resource with its `comp` parameter.
    fn auth_header(
        &self,
        verb: &str,
        date: &str,
        content_type: &str,
        container: &str,
        key: Option<&str>,
        comp: Option<&str>,
    ) -> String {
        let headers = format!("x-ms-date:{date}\nx-ms-version:{API_VERSION}\n");
        let mut resource = format!("/{}/{container}", self.account);
        if let Some(key) = key {
            resource.push('/');
            resource.push_str(key);
        }
        if let Some(comp) = comp {
            resource.push_str("?comp=");
            resource.push_str(comp);
        }
        let string_to_sign = format!("{verb}\n\n{content_type}\n\n{headers}{resource}");
        let signature = BASE64.encode(hmac_sha256(&self.key, string_to_sign.as_bytes()));
        format!("SharedKeyLite {}:{signature}", self.account)
    }

    /// `<BlockList>` commit body, IDs in the given order.
    fn block_list_body(block_ids: &[String]) -> String {
        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in block_ids {
            body.push_str("<Latest>");
            body.push_str(id);
            body.push_str("</Latest>");
        }
        body.push_str("</BlockList>");
        body
    }
}

impl Transport for AzureStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let url = format!(
            "{}/{container}?restype=container&comp=list&prefix={}",
            self.endpoint,
            percent_encode(prefix)
        );
        let date = Self::now_rfc1123();
        let auth = self.auth_header("GET", &date, "", container, None, Some("list"));
        let resp = self
            .client
            .get(url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(AUTHORIZATION, auth)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let body = resp.text().await?;
        Ok(values_of(&body, "Name"))
    }

    async fn metadata(&self, container: &str, key: &str) -> Result<ObjectMeta, TransportError> {
        let date = Self::now_rfc1123();
        let auth = self.auth_header("HEAD", &date, "", container, Some(key), None);
        let resp = self
            .client
            .head(self.object_url(container, key))
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(AUTHORIZATION, auth)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or(TransportError::Backend {
                status: resp.status().as_u16(),
                message: "missing Content-Length".into(),
            })?;
        let content_md5 = resp
            .headers()
            .get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| BASE64.decode(v).ok())
            .map(hex::encode)
            .unwrap_or_default();
        Ok(ObjectMeta { size, content_md5 })
    }

    async fn get_range(
        &self,
        container: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let date = Self::now_rfc1123();
        let auth = self.auth_header("GET", &date, "", container, Some(key), None);
        let resp = self
            .client
            .get(self.object_url(container, key))
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(AUTHORIZATION, auth)
            .header(RANGE, format!("bytes={offset}-{}", offset + length - 1))
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp.bytes().await?.to_vec()),
            StatusCode::OK => {
                // Backend ignored the Range header and returned the whole
                // object; only acceptable when the whole object was asked for.
                let data = resp.bytes().await?.to_vec();
                if offset == 0 && data.len() as u64 == length {
                    Ok(data)
                } else {
                    Err(TransportError::RangeUnsupported)
                }
            }
            _ => Err(status_error(resp).await),
        }
    }

    async fn put_part(
        &self,
        container: &str,
        key: &str,
        block_id: &str,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        let url = format!(
            "{}?comp=block&blockid={}",
            self.object_url(container, key),
            percent_encode(block_id)
        );
        let date = Self::now_rfc1123();
        let content_type = "application/octet-stream";
        let auth = self.auth_header("PUT", &date, content_type, container, Some(key), Some("block"));
        debug!(container, key, block_id, bytes = data.len(), "staging block");
        let resp = self
            .client
            .put(url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(AUTHORIZATION, auth)
            .header(CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        Ok(())
    }

    async fn commit_parts(
        &self,
        container: &str,
        key: &str,
        block_ids: &[String],
    ) -> Result<(), TransportError> {
        let url = format!("{}?comp=blocklist", self.object_url(container, key));
        let date = Self::now_rfc1123();
        let content_type = "application/xml";
        let auth =
            self.auth_header("PUT", &date, content_type, container, Some(key), Some("blocklist"));
        debug!(container, key, blocks = block_ids.len(), "committing block list");
        let resp = self
            .client
            .put(url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(AUTHORIZATION, auth)
            .header(CONTENT_TYPE, content_type)
            .body(Self::block_list_body(block_ids))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("InvalidBlockList") {
                // The service does not name the offending IDs.
                return Err(TransportError::IncompleteParts { missing: vec![] });
            }
            return Err(TransportError::Backend {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }
        if !status.is_success() {
            return Err(status_error(resp).await);
        }
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), TransportError> {
        let date = Self::now_rfc1123();
        let auth = self.auth_header("DELETE", &date, "", container, Some(key), None);
        let resp = self
            .client
            .delete(self.object_url(container, key))
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(AUTHORIZATION, auth)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        Ok(())
    }

    /// Service-SAS read URL, valid from now until `ttl` elapses.
    fn sign_temporary_url(
        &self,
        container: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, TransportError> {
        let start = Utc::now();
        let expiry = start + ChronoDuration::seconds(ttl.as_secs() as i64);
        let st = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let se = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resource = format!("/blob/{}/{container}/{key}", self.account);
        let string_to_sign =
            format!("r\n{st}\n{se}\n{resource}\n\n\nhttps\n{API_VERSION}\nb\n\n\n\n\n\n");
        let signature = BASE64.encode(hmac_sha256(&self.key, string_to_sign.as_bytes()));
        Ok(format!(
            "{}/{container}/{key}?sv={API_VERSION}&st={}&se={}&sr=b&sp=r&spr=https&sig={}",
            self.endpoint,
            percent_encode(&st),
            percent_encode(&se),
            percent_encode(&signature)
        ))
    }
}
