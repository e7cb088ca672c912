use std::io::Read;

use ureq::{http::Response, Body};

use crate::{error::DownloadError, http_client};

pub struct Http;

impl Http {
    /// Issue a GET request and fail on any non-success status.
    pub fn fetch(url: &str) -> Result<Response<Body>, DownloadError> {
        let resp = http_client::get(url).call()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }

    /// Read a whole response body into memory.
    pub fn bytes(url: &str) -> Result<Vec<u8>, DownloadError> {
        let resp = Self::fetch(url)?;
        let mut data = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut data)
            .map_err(|_| DownloadError::InvalidResponse)?;
        Ok(data)
    }
}
