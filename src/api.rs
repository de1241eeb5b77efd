//! HTTP JSON control plane
//!
//! Listens on loopback only. Every route maps onto one `Core` operation;
//! errors come back as `{"error": kind, "message": text}`.

use crate::database::DomainId;
use crate::error::{Error, Result};
use crate::orchestrator::Core;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
pub struct AddDomainRequest {
    pub domain: String,
    pub target: String,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Debug, Deserialize)]
pub struct SslRequest {
    pub ssl: bool,
}

#[derive(Debug, Deserialize)]
pub struct CertificateRequest {
    pub domain: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartProxyRequest {
    #[serde(default)]
    pub port: Option<u16>,
}

/// Serve the control API until the listener fails
pub async fn serve(listener: TcpListener, core: Arc<Core>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Control API listening on {}", addr);
    }

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Control API accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let core = Arc::clone(&core);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let core = Arc::clone(&core);
                async move { Ok::<_, Infallible>(handle(req, &core).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Control connection from {} ended: {}", remote_addr, e);
            }
        });
    }
}

async fn handle(req: Request<Incoming>, core: &Core) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    match route(req, core).await {
        Ok(response) => response,
        Err(e) => {
            if matches!(e, Error::Storage(_) | Error::Io(_)) {
                warn!("{} {} failed: {}", method, path, e);
            }
            error_response(&e)
        }
    }
}

async fn route(req: Request<Incoming>, core: &Core) -> Result<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        // processes
        (&Method::GET, ["api", "processes"]) => json(StatusCode::OK, &core.list_processes()),
        (&Method::POST, ["api", "processes", "refresh"]) => {
            json(StatusCode::OK, &core.refresh_processes().await)
        }

        // domains
        (&Method::GET, ["api", "domains"]) => json(StatusCode::OK, &core.list_domains()),
        (&Method::POST, ["api", "domains"]) => {
            let body: AddDomainRequest = read_json(req).await?;
            json(StatusCode::CREATED, &core.add_domain(&body.domain, &body.target, body.ssl)?)
        }
        (&Method::POST, ["api", "domains", id, "toggle"]) => {
            json(StatusCode::OK, &core.toggle_domain(&DomainId::from(*id))?)
        }
        (&Method::POST, ["api", "domains", id, "ssl"]) => {
            let id = DomainId::from(*id);
            let body: SslRequest = read_json(req).await?;
            json(StatusCode::OK, &core.set_domain_ssl(&id, body.ssl)?)
        }
        (&Method::DELETE, ["api", "domains", id]) => {
            core.delete_domain(&DomainId::from(*id))?;
            Ok(no_content())
        }
        (&Method::GET, ["api", "hosts", "permission"]) => json(
            StatusCode::OK,
            &json!({ "has_permission": core.has_hosts_permission() }),
        ),

        // certificates
        (&Method::GET, ["api", "certificates"]) => json(StatusCode::OK, &core.list_certificates()),
        (&Method::POST, ["api", "certificates"]) => {
            let body: CertificateRequest = read_json(req).await?;
            json(StatusCode::CREATED, &core.generate_certificate(&body.domain)?)
        }
        (&Method::DELETE, ["api", "certificates", domain]) => {
            core.delete_certificate(domain)?;
            Ok(no_content())
        }
        (&Method::GET, ["api", "ca"]) => json(
            StatusCode::OK,
            &json!({ "status": core.root_ca_status(), "pem": core.root_ca_pem() }),
        ),
        (&Method::POST, ["api", "ca", "install"]) => {
            core.install_root_ca()?;
            json(StatusCode::OK, &json!({ "status": core.root_ca_status() }))
        }

        // proxy
        (&Method::GET, ["api", "proxy"]) => json(StatusCode::OK, &core.proxy_status().await),
        (&Method::POST, ["api", "proxy", "start"]) => {
            let body: StartProxyRequest = read_json_or_default(req).await?;
            json(StatusCode::OK, &core.start_proxy(body.port).await?)
        }
        (&Method::POST, ["api", "proxy", "stop"]) => {
            core.stop_proxy().await?;
            json(StatusCode::OK, &core.proxy_status().await)
        }

        // service
        (&Method::GET, ["api", "service"]) => json(StatusCode::OK, &core.service_status()),
        (&Method::GET, ["api", "service", "logs"]) => json(StatusCode::OK, &core.service_logs()),
        (&Method::POST, ["api", "service", "refresh"]) => {
            json(StatusCode::OK, &core.refresh_service().await?)
        }
        (&Method::POST, ["api", "service", action]) => {
            json(StatusCode::OK, &core.service_action(action).await?)
        }

        _ => Err(Error::NotFound(format!("{} {}", method, path))),
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes> {
    req.into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .map_err(|e| Error::Validation(format!("cannot read request body: {e}")))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Validation(format!("invalid JSON body: {e}")))
}

/// An empty body means every field takes its default
async fn read_json_or_default<T: DeserializeOwned + Default>(req: Request<Incoming>) -> Result<T> {
    let bytes = read_body(req).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| Error::Validation(format!("invalid JSON body: {e}")))
}

/// HTTP status for an error kind
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) | Error::Bind { .. } => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Permission(_) => StatusCode::FORBIDDEN,
        Error::Ca(_) => StatusCode::BAD_GATEWAY,
        Error::Install(_) | Error::Service(_) | Error::Storage(_) | Error::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

fn error_response(error: &Error) -> Response<Full<Bytes>> {
    let body = ErrorBody {
        error: error.kind().to_string(),
        message: error.to_string(),
    };
    json(status_for(error), &body).unwrap_or_else(|_| plain_error())
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value).map_err(|e| Error::Io(e.into()))?;
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn no_content() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

fn plain_error() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Internal Server Error")));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::Conflict("a.local".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::Bind { port: 80, reason: "in use".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&Error::NotFound("id".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::Permission("hosts".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::Ca("sign".into())), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_body() {
        let response = error_response(&Error::Conflict("myapp.local".into()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_add_domain_request_defaults_ssl() {
        let req: AddDomainRequest =
            serde_json::from_str(r#"{"domain":"myapp.local","target":"http://localhost:3000"}"#).unwrap();
        assert!(!req.ssl);
    }
}
