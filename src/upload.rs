//! Firmware upload to the OTA store.
//!
//! One PUT per invocation:
//!   `<base>/esp32-firmware/<firmware name>/<YYYY-MM-DD>`
//! with the image streamed from disk as `application/octet-stream`.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use tokio_util::io::ReaderStream;

use crate::error::{OtaError, Result};

/// Path segment under which the store keeps ESP32 images.
pub const BUCKET: &str = "esp32-firmware";

/// Header the store uses to route an OTA command to a device.
pub const DEVICE_HEADER: HeaderName = HeaderName::from_static("mqtt_device");

const OCTET_STREAM: &str = "application/octet-stream";

/// One firmware upload, built fresh for each invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub firmware_path: PathBuf,
    pub firmware_name: String,
    pub version:       NaiveDate,
    pub device:        Option<String>,
}

impl UploadRequest {
    pub fn new(firmware_path: &Path, device: Option<&str>, today: NaiveDate) -> Result<Self> {
        Ok(Self {
            firmware_path: firmware_path.to_path_buf(),
            firmware_name: firmware_name(firmware_path)?,
            version:       today,
            device:        device
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from),
        })
    }

    /// Version label, ISO-8601 calendar date.
    pub fn version_label(&self) -> String {
        self.version.format("%Y-%m-%d").to_string()
    }

    /// Destination URL under `base_url` (scheme, host and port).
    pub fn url(&self, base_url: &str) -> String {
        [
            base_url.trim_end_matches('/'),
            BUCKET,
            self.firmware_name.as_str(),
            self.version_label().as_str(),
        ]
        .join("/")
    }

    pub fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
        if let Some(device) = &self.device {
            let value = HeaderValue::from_str(device).map_err(|_| {
                OtaError::Config(format!("device id {device:?} is not a valid header value"))
            })?;
            headers.insert(DEVICE_HEADER, value);
        }
        Ok(headers)
    }
}

/// Base name of `path` with its final extension removed.
pub fn firmware_name(path: &Path) -> Result<String> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(OtaError::Config(format!(
            "cannot derive firmware name from {}",
            path.display()
        )));
    }
    Ok(name)
}

/// PUT the firmware image to the store.
///
/// Any non-2xx answer is returned as [`OtaError::Http`] carrying the status
/// and response body; transport failures come back as
/// [`OtaError::Network`].
pub async fn upload(http: &Client, base_url: &str, req: &UploadRequest) -> Result<()> {
    let url = req.url(base_url);
    let mut headers = req.headers()?;

    let firmware_err = |source: std::io::Error| OtaError::Firmware {
        path: req.firmware_path.clone(),
        source,
    };
    let file = tokio::fs::File::open(&req.firmware_path)
        .await
        .map_err(firmware_err)?;
    let len = file.metadata().await.map_err(firmware_err)?.len();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));

    debug!("PUT {url} ({len} bytes)");
    let resp = http
        .put(&url)
        .headers(headers)
        .body(Body::wrap_stream(ReaderStream::new(file)))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("(response body unreadable: {e})"));
        return Err(OtaError::Http { status, body });
    }
    info!("{} stored as {url} ({status})", req.firmware_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    fn firmware_file(bytes: &[u8]) -> NamedTempFile {
        let mut f = tempfile::Builder::new()
            .prefix("light")
            .suffix(".bin")
            .tempfile()
            .unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn name_strips_final_extension_only() {
        assert_eq!(firmware_name(Path::new("firmware.bin")).unwrap(), "firmware");
        assert_eq!(
            firmware_name(Path::new(".pio/build/esp32dev/firmware.bin")).unwrap(),
            "firmware"
        );
        assert_eq!(
            firmware_name(Path::new("/a/b/c/d/e/node.v2.bin")).unwrap(),
            "node.v2"
        );
        assert_eq!(firmware_name(Path::new("noext")).unwrap(), "noext");
    }

    #[test]
    fn name_must_not_be_empty() {
        assert!(firmware_name(Path::new("")).is_err());
        assert!(firmware_name(Path::new("/")).is_err());
    }

    #[test]
    fn version_label_is_iso_date() {
        let req = UploadRequest::new(Path::new("fw.bin"), None, day()).unwrap();
        let label = req.version_label();
        assert_eq!(label, "2024-03-09");
        assert_eq!(NaiveDate::parse_from_str(&label, "%Y-%m-%d").unwrap(), day());
    }

    #[test]
    fn url_segments_in_order() {
        let req = UploadRequest::new(Path::new("build/esp32dev/firmware.bin"), None, day())
            .unwrap();
        let url = req.url("http://core.voneicken.com:1880");
        assert_eq!(url, "http://core.voneicken.com:1880/esp32-firmware/firmware/2024-03-09");

        let tail: Vec<&str> = url
            .strip_prefix("http://")
            .unwrap()
            .split('/')
            .collect();
        assert_eq!(tail, ["core.voneicken.com:1880", BUCKET, "firmware", "2024-03-09"]);

        // Trailing slash on the base does not produce an empty segment.
        assert_eq!(req.url("http://h:1880/"), "http://h:1880/esp32-firmware/firmware/2024-03-09");
    }

    #[test]
    fn device_header_only_when_set() {
        let with = UploadRequest::new(Path::new("fw.bin"), Some("light-1"), day()).unwrap();
        let h = with.headers().unwrap();
        assert_eq!(h.get(CONTENT_TYPE).unwrap(), OCTET_STREAM);
        assert_eq!(h.get(&DEVICE_HEADER).unwrap(), "light-1");

        for device in [None, Some(""), Some("   ")] {
            let req = UploadRequest::new(Path::new("fw.bin"), device, day()).unwrap();
            assert!(req.device.is_none());
            let h = req.headers().unwrap();
            assert!(h.get(&DEVICE_HEADER).is_none(), "device={device:?}");
            assert_eq!(h.len(), 1);
        }
    }

    #[test]
    fn device_with_newline_rejected() {
        let req = UploadRequest::new(Path::new("fw.bin"), Some("a\nb"), day()).unwrap();
        assert!(matches!(req.headers(), Err(OtaError::Config(_))));
    }

    #[tokio::test]
    async fn upload_success() {
        let server = MockServer::start().await;
        let image = b"\xe9\x06\x02\x20firmware-bytes".to_vec();
        let fw = firmware_file(&image);
        let req = UploadRequest::new(fw.path(), Some("light-1"), day()).unwrap();
        let route = format!("/{BUCKET}/{}/2024-03-09", req.firmware_name);

        Mock::given(method("PUT"))
            .and(path(route.as_str()))
            .and(header("content-type", OCTET_STREAM))
            .and(header("mqtt_device", "light-1"))
            .and(body_bytes(image.clone()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        upload(&client(), &server.uri(), &req).await.unwrap();
    }

    #[tokio::test]
    async fn upload_server_error_reports_status_and_body() {
        let server = MockServer::start().await;
        let fw = firmware_file(b"img");
        let req = UploadRequest::new(fw.path(), None, day()).unwrap();

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("server error"))
            .mount(&server)
            .await;

        let err = upload(&client(), &server.uri(), &req).await.unwrap_err();
        match &err {
            OtaError::Http { status, body } => {
                assert_eq!(status.as_u16(), 500);
                assert_eq!(body, "server error");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
        let d = err.diagnostic();
        assert!(d.contains("500") && d.contains("server error"), "{d}");
    }

    #[tokio::test]
    async fn upload_unreachable_host() {
        // Grab a free port, then close it so nothing is listening.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let fw = firmware_file(b"img");
        let req = UploadRequest::new(fw.path(), None, day()).unwrap();

        let err = upload(&client(), &format!("http://127.0.0.1:{port}"), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::Network(_)), "{err:?}");
        let d = err.diagnostic();
        // The connect failure sits below reqwest's "error sending request".
        assert!(d.contains("error sending request"), "{d}");
        assert!(d.contains("Connection refused"), "{d}");
    }

    #[tokio::test]
    async fn upload_missing_file() {
        let server = MockServer::start().await;
        let req = UploadRequest::new(Path::new("/nonexistent/firmware.bin"), None, day())
            .unwrap();

        let err = upload(&client(), &server.uri(), &req).await.unwrap_err();
        assert!(matches!(err, OtaError::Firmware { .. }), "{err:?}");
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
