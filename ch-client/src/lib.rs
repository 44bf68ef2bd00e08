//! Minimal client for the cloud-hypervisor REST API.
//!
//! cloud-hypervisor exposes its management API as HTTP over a Unix domain
//! socket (`--api-socket`). This crate wraps the handful of endpoints needed
//! to drive a VM lifecycle: create, boot, shutdown, power-button, delete,
//! info, and the VMM-level ping/shutdown calls.

pub mod models;

use std::fmt::{self, Debug, Display};
use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};

#[derive(Debug)]
pub enum Error {
    Api(ApiError),
    Http(hyper::http::Error),
    Hyper(hyper::Error),
    HyperClient(hyper_util::client::legacy::Error),
    Serde(serde_json::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Api(e) => {
                write!(
                    f,
                    "API error: {} {}",
                    e.code,
                    String::from_utf8_lossy(&e.body)
                )
            }
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Hyper(e) => write!(f, "Hyper error: {e}"),
            Error::HyperClient(e) => write!(f, "Hyper client error: {e}"),
            Error::Serde(e) => write!(f, "Serde error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Status code of the API response, when the error carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api(e) => Some(e.code),
            _ => None,
        }
    }

    /// True when the VMM answered 404, i.e. no VM exists yet/anymore.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

pub struct ApiError {
    pub code: StatusCode,
    pub body: Bytes,
}

impl Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("code", &self.code)
            .field("body", &String::from_utf8_lossy(&self.body))
            .finish()
    }
}

/// Client for a single cloud-hypervisor process, addressed by its API socket.
#[derive(Clone)]
pub struct ApiClient {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl ApiClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, Error> {
        let uri: hyper::Uri =
            Uri::new(&self.socket_path, &format!("/api/v1/{endpoint}")).into();

        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(Error::Http)?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(Error::HyperClient)?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(Error::Hyper)?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::Api(ApiError {
                code: status,
                body: bytes,
            }));
        }
        Ok(bytes)
    }

    async fn put(&self, endpoint: &str, body: Option<Vec<u8>>) -> Result<(), Error> {
        self.request(Method::PUT, endpoint, body).await.map(|_| ())
    }

    /// Ping the VMM itself; succeeds as soon as the API socket is served.
    pub async fn vmm_ping(&self) -> Result<models::VmmPingResponse, Error> {
        let bytes = self.request(Method::GET, "vmm.ping", None).await?;
        serde_json::from_slice(&bytes).map_err(Error::Serde)
    }

    /// Shut down the VMM process.
    pub async fn shutdown_vmm(&self) -> Result<(), Error> {
        self.put("vmm.shutdown", None).await
    }

    pub async fn create_vm(&self, config: &models::VmConfig) -> Result<(), Error> {
        let body = serde_json::to_vec(config).map_err(Error::Serde)?;
        self.put("vm.create", Some(body)).await
    }

    pub async fn boot_vm(&self) -> Result<(), Error> {
        self.put("vm.boot", None).await
    }

    /// Graceful in-guest shutdown request (ACPI power button).
    pub async fn power_button_vm(&self) -> Result<(), Error> {
        self.put("vm.power-button", None).await
    }

    pub async fn shutdown_vm(&self) -> Result<(), Error> {
        self.put("vm.shutdown", None).await
    }

    pub async fn delete_vm(&self) -> Result<(), Error> {
        self.put("vm.delete", None).await
    }

    pub async fn vm_info(&self) -> Result<models::VmInfo, Error> {
        let bytes = self.request(Method::GET, "vm.info", None).await?;
        serde_json::from_slice(&bytes).map_err(Error::Serde)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_is_not_found() {
        let err = Error::Api(ApiError {
            code: StatusCode::NOT_FOUND,
            body: Bytes::new(),
        });
        assert!(err.is_not_found());

        let err = Error::Api(ApiError {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::new(),
        });
        assert!(!err.is_not_found());
    }

    #[test]
    fn vm_state_parses() {
        let info: models::VmInfo =
            serde_json::from_str(r#"{"state":"Running","memory_actual_size":1024}"#).unwrap();
        assert_eq!(info.state, models::VmState::Running);
    }
}
