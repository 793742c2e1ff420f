//! ipstack-compatible geolocation API client
//!
//! Endpoint: `GET {base_url}{address}?access_key={key}`
//! Only `latitude` and `longitude` are read from the response. ipstack
//! reports failures as `200 OK` with `success: false`, so both shapes are
//! handled. No retries.

use super::{GeoLocation, GeoLookup};
use crate::error::{HopscopeError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct IpstackResponse {
    latitude: Option<f64>,
    longitude: Option<f64>,
    success: Option<bool>,
    error: Option<IpstackError>,
}

#[derive(Debug, Deserialize)]
struct IpstackError {
    code: Option<i64>,
    info: Option<String>,
}

impl IpstackResponse {
    fn into_location(self) -> Result<Option<GeoLocation>> {
        if self.success == Some(false) || self.error.is_some() {
            let (code, info) = self
                .error
                .map(|e| (e.code.unwrap_or_default(), e.info.unwrap_or_default()))
                .unwrap_or_default();
            return Err(HopscopeError::Other(anyhow::anyhow!(
                "ipstack error {}: {}",
                code,
                info
            )));
        }

        Ok(match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoLocation {
                latitude,
                longitude,
            }),
            _ => None,
        })
    }
}

/// HTTP client for the geolocation API
pub struct IpstackClient {
    client: Client,
    base_url: String,
    access_key: String,
}

impl IpstackClient {
    pub fn new(base_url: &str, access_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };

        Ok(Self {
            client,
            base_url,
            access_key: access_key.to_string(),
        })
    }

    fn url(&self, address: &str) -> String {
        format!("{}{}?access_key={}", self.base_url, address, self.access_key)
    }
}

#[async_trait]
impl GeoLookup for IpstackClient {
    async fn locate(&self, address: &str) -> Result<Option<GeoLocation>> {
        tracing::debug!("Requesting location of {} from ipstack", address);

        let response = self.client.get(self.url(address)).send().await?;

        if !response.status().is_success() {
            return Err(HopscopeError::Other(anyhow::anyhow!(
                "ipstack API returned {}",
                response.status()
            )));
        }

        let body: IpstackResponse = response.json().await?;
        body.into_location()
    }

    fn name(&self) -> &'static str {
        "ipstack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Option<GeoLocation>> {
        serde_json::from_str::<IpstackResponse>(json)
            .unwrap()
            .into_location()
    }

    #[test]
    fn test_url_building() {
        let client =
            IpstackClient::new("http://api.ipstack.com", "secret", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.url("8.8.8.8"),
            "http://api.ipstack.com/8.8.8.8?access_key=secret"
        );
    }

    #[test]
    fn test_located_response() {
        let location = parse(
            r#"{"ip":"8.8.8.8","type":"ipv4","latitude":37.386,"longitude":-122.0838}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(location.latitude, 37.386);
        assert_eq!(location.longitude, -122.0838);
    }

    #[test]
    fn test_null_coordinates() {
        assert_eq!(
            parse(r#"{"ip":"10.0.0.1","latitude":null,"longitude":null}"#).unwrap(),
            None
        );
        assert_eq!(parse("{}").unwrap(), None);
    }

    #[test]
    fn test_error_body() {
        let err = parse(
            r#"{"success":false,"error":{"code":101,"type":"missing_access_key","info":"You have not supplied an API Access Key."}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("101"));
    }
}
