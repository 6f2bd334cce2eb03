//! S3-compatible dialect.
//!
//! Block staging maps onto temporary staging objects plus a server-side
//! multipart copy at commit time: `put_part` writes each block under
//! `<key>.blocks/<id>`, and `commit_parts` assembles the final object with
//! upload-part-copy calls in commit-list order. The commit list alone fixes
//! final byte order, even though the native multipart API numbers parts at
//! staging time.
//!
//! Requests are signed with Signature Version 4.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::status_error;
use crate::sign::{hmac_sha256, percent_encode, sha256_hex};
use crate::xml::values_of;
use crate::{AuthInput, ObjectMeta, Transport, TransportError};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3-compatible backend.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Store {
    /// Builds a client for `region` with the given access key pair.
    pub fn new(region: &str, auth: &AuthInput) -> Self {
        Self {
            client: Client::new(),
            region: region.to_string(),
            access_key: auth.username.clone(),
            secret_key: auth.secret.clone(),
        }
    }

    fn host(&self, container: &str) -> String {
        format!("{container}.{SERVICE}.{}.amazonaws.com", self.region)
    }

    /// Percent-encodes a key for the URI path, keeping `/` separators.
    fn encode_path(key: &str) -> String {
        let encoded: Vec<String> = key.split('/').map(percent_encode).collect();
        format!("/{}", encoded.join("/"))
    }

    /// Path-safe staging key for one block.
    fn staged_key(key: &str, block_id: &str) -> String {
        format!("{key}.blocks/{}", hex::encode(block_id.as_bytes()))
    }

    fn scope(&self, date: &str) -> String {
        format!("{date}/{}/{SERVICE}/aws4_request", self.region)
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }

    fn canonical_query(query: &[(String, String)]) -> String {
        let mut pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (percent_encode(k), percent_encode(v)))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Signs one request; returns the headers to attach (including
    /// Authorization) in addition to Host.
    ///
    /// `extra_headers` must be lowercase-named and pre-sorted relative to the
    /// x-amz-* headers added here.
    fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        payload_sha256: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: Vec<(String, String)> = vec![("host".into(), host.to_string())];
        headers.extend(extra_headers.iter().cloned());
        headers.push(("x-amz-content-sha256".into(), payload_sha256.to_string()));
        headers.push(("x-amz-date".into(), amz_date.clone()));
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{path}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_sha256}",
            Self::canonical_query(query)
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{}\n{}",
            self.scope(&date),
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(&self.signing_key(&date), string_to_sign.as_bytes()));

        let authorization = format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key,
            self.scope(&date)
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".into(), authorization));
        out
    }

    fn url(host: &str, path: &str, query: &[(String, String)]) -> String {
        if query.is_empty() {
            format!("https://{host}{path}")
        } else {
            format!("https://{host}{path}?{}", Self::canonical_query(query))
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        container: &str,
        path: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        body: Option<Vec<u8>>,
        range: Option<(u64, u64)>,
    ) -> Result<reqwest::Response, TransportError> {
        let host = self.host(container);
        let payload_sha256 = match &body {
            Some(bytes) => sha256_hex(bytes),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let signed = self.sign(
            method.as_str(),
            &host,
            path,
            query,
            extra_headers,
            &payload_sha256,
            Utc::now(),
        );

        let mut req = self
            .client
            .request(method, Self::url(&host, path, query));
        for (name, value) in &signed {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some((offset, length)) = range {
            req = req.header(RANGE, format!("bytes={offset}-{}", offset + length - 1));
        }
        if let Some(bytes) = body {
            req = req.body(bytes);
        }
        Ok(req.send().await?)
    }
}

impl Transport for S3Store {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        let resp = self
            .send(reqwest::Method::GET, container, "/", &query, &[], None, None)
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let body = resp.text().await?;
        Ok(values_of(&body, "Key"))
    }

    async fn metadata(&self, container: &str, key: &str) -> Result<ObjectMeta, TransportError> {
        let path = Self::encode_path(key);
        let resp = self
            .send(reqwest::Method::HEAD, container, &path, &[], &[], None, None)
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
        // Single-put objects report their MD5 as the ETag.
        let content_md5 = resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| v.len() == 32 && v.bytes().all(|b| b.is_ascii_hexdigit()))
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
        let path = Self::encode_path(key);
        let resp = self
            .send(
                reqwest::Method::GET,
                container,
                &path,
                &[],
                &[],
                None,
                Some((offset, length)),
            )
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp.bytes().await?.to_vec()),
            StatusCode::OK => {
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
        let path = Self::encode_path(&Self::staged_key(key, block_id));
        debug!(container, key, block_id, bytes = data.len(), "staging block object");
        let resp = self
            .send(reqwest::Method::PUT, container, &path, &[], &[], Some(data), None)
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
        let path = Self::encode_path(key);

        // Open the multipart upload.
        let query = vec![("uploads".to_string(), String::new())];
        let resp = self
            .send(reqwest::Method::POST, container, &path, &query, &[], None, None)
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let body = resp.text().await?;
        let upload_id = values_of(&body, "UploadId")
            .into_iter()
            .next()
            .ok_or(TransportError::Backend {
                status: 200,
                message: "initiate response carried no UploadId".into(),
            })?;

        // Server-side copy of each staged block, part numbers in list order.
        let mut etags = Vec::with_capacity(block_ids.len());
        for (i, block_id) in block_ids.iter().enumerate() {
            let source = format!(
                "/{container}{}",
                Self::encode_path(&Self::staged_key(key, block_id))
            );
            let query = vec![
                ("partNumber".to_string(), (i + 1).to_string()),
                ("uploadId".to_string(), upload_id.clone()),
            ];
            let headers = vec![("x-amz-copy-source".to_string(), source)];
            let resp = self
                .send(reqwest::Method::PUT, container, &path, &query, &headers, None, None)
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(TransportError::IncompleteParts {
                    missing: vec![block_id.clone()],
                });
            }
            if !resp.status().is_success() {
                return Err(status_error(resp).await);
            }
            let body = resp.text().await?;
            let etag = values_of(&body, "ETag")
                .into_iter()
                .next()
                .ok_or(TransportError::Backend {
                    status: 200,
                    message: "copy response carried no ETag".into(),
                })?;
            etags.push(etag);
        }

        // Complete, fixing final byte order.
        let mut complete = String::from("<CompleteMultipartUpload>");
        for (i, etag) in etags.iter().enumerate() {
            complete.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{etag}</ETag></Part>",
                i + 1
            ));
        }
        complete.push_str("</CompleteMultipartUpload>");
        let query = vec![("uploadId".to_string(), upload_id)];
        let headers = vec![("content-type".to_string(), "application/xml".to_string())];
        let resp = self
            .send(
                reqwest::Method::POST,
                container,
                &path,
                &query,
                &headers,
                Some(complete.into_bytes()),
                None,
            )
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        // Best-effort cleanup of staging objects.
        for block_id in block_ids {
            let staged = Self::encode_path(&Self::staged_key(key, block_id));
            match self
                .send(reqwest::Method::DELETE, container, &staged, &[], &[], None, None)
                .await
            {
                Ok(_) => {}
                Err(e) => warn!(container, key, block_id, error = %e, "staging cleanup failed"),
            }
        }
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), TransportError> {
        let path = Self::encode_path(key);
        let resp = self
            .send(reqwest::Method::DELETE, container, &path, &[], &[], None, None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        Ok(())
    }

    /// Presigned GET URL (query-string SigV4), valid for `ttl`.
    fn sign_temporary_url(
        &self,
        container: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, TransportError> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let host = self.host(container);
        let path = Self::encode_path(key);

        let credential = format!("{}/{}", self.access_key, self.scope(&date));
        let query = vec![
            ("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), ttl.as_secs().to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        let canonical_request = format!(
            "GET\n{path}\n{}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD",
            Self::canonical_query(&query)
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{}\n{}",
            self.scope(&date),
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(&self.signing_key(&date), string_to_sign.as_bytes()));

        Ok(format!(
            "https://{host}{path}?{}&X-Amz-Signature={signature}",
            Self::canonical_query(&query)
        ))
    }
}
