use super::{decode_response, encode_call, Value, XmlRpcError, XmlRpcResult};
use hyperlocal::{UnixClientExt, Uri as UnixUri};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::trace;

const RPC_PATH: &str = "/RPC2";

/// Where an XML-RPC server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcEndpoint {
    /// Unix socket, used for the local host
    Unix(PathBuf),
    /// HTTP over TCP, used for remote hosts
    Tcp { host: String, port: u16 },
}

impl RpcEndpoint {
    /// Pick the unix socket for the local host and TCP otherwise
    pub fn select(is_local: bool, socket: &Path, host: &str, port: u16) -> Self {
        if is_local {
            RpcEndpoint::Unix(socket.to_path_buf())
        } else {
            RpcEndpoint::Tcp {
                host: host.to_string(),
                port,
            }
        }
    }

    fn uri(&self) -> XmlRpcResult<hyper::Uri> {
        match self {
            RpcEndpoint::Unix(socket) => Ok(UnixUri::new(socket, RPC_PATH).into()),
            RpcEndpoint::Tcp { host, port } => format!("http://{}:{}{}", host, port, RPC_PATH)
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| XmlRpcError::Request(e.into())),
        }
    }
}

impl fmt::Display for RpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcEndpoint::Unix(socket) => write!(f, "unix:{}", socket.display()),
            RpcEndpoint::Tcp { host, port } => write!(f, "http://{}:{}", host, port),
        }
    }
}

#[derive(Clone)]
enum HttpClient {
    Unix(hyper::Client<hyperlocal::UnixConnector>),
    Tcp(hyper::Client<hyper::client::HttpConnector>),
}

/// XML-RPC over HTTP/1.1
#[derive(Clone)]
pub struct RpcTransport {
    endpoint: RpcEndpoint,
    client: HttpClient,
}

impl RpcTransport {
    pub fn new(endpoint: RpcEndpoint) -> Self {
        let client = match endpoint {
            RpcEndpoint::Unix(_) => HttpClient::Unix(hyper::Client::unix()),
            RpcEndpoint::Tcp { .. } => HttpClient::Tcp(hyper::Client::new()),
        };
        Self { endpoint, client }
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    /// Issue one method call and decode its return value
    pub async fn call(&self, method: &str, params: &[Value]) -> XmlRpcResult<Value> {
        let body = encode_call(method, params);
        trace!(endpoint = %self.endpoint, method, "xml-rpc call");

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(self.endpoint.uri()?)
            .header("Content-Type", "text/xml")
            .body(hyper::Body::from(body))?;

        let response = match &self.client {
            HttpClient::Unix(client) => client.request(request).await?,
            HttpClient::Tcp(client) => client.request(request).await?,
        };

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            return Err(XmlRpcError::Status(status.as_u16()));
        }

        decode_response(&String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
