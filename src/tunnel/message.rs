//! Tunnel wire conventions
//!
//! Every tunnel request targets [`TUNNEL_PATH`]; the method selects the
//! operation and the [`TUNNEL_ID_HEADER`] header names the tunnel:
//!
//! | Method   | Operation    | Body            |
//! |----------|--------------|-----------------|
//! | `POST`   | open         | none            |
//! | `PUT`    | send-data    | bytes (non-empty) |
//! | `GET`    | receive-data | none            |
//! | `DELETE` | close        | none            |
//!
//! This module builds those requests and their responses, and classifies
//! incoming ones.

use super::{Error, Result, TunnelId};
use crate::http::{HttpRequest, HttpResponse, Method, Status};
use bytes::Bytes;

/// Request path shared by all tunnel operations
pub const TUNNEL_PATH: &str = "/http-tunnel";

/// Header carrying the tunnel identifier
pub const TUNNEL_ID_HEADER: &str = "X-Tunnel-Id";

/// Header marking the final receive-data response of a tunnel the server closed
pub const TUNNEL_CLOSED_HEADER: &str = "X-Tunnel-Closed";

/// A tunnel protocol operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelOperation {
    Open,
    SendData,
    ReceiveData,
    Close,
}

impl TunnelOperation {
    /// Determine which operation `request` asks for, if any
    pub fn classify(request: &HttpRequest) -> Option<Self> {
        if request.path() != TUNNEL_PATH {
            return None;
        }

        match request.method() {
            Method::Post => Some(TunnelOperation::Open),
            Method::Put => Some(TunnelOperation::SendData),
            Method::Get => Some(TunnelOperation::ReceiveData),
            Method::Delete => Some(TunnelOperation::Close),
            _ => None,
        }
    }

    pub fn method(&self) -> Method {
        match self {
            TunnelOperation::Open => Method::Post,
            TunnelOperation::SendData => Method::Put,
            TunnelOperation::ReceiveData => Method::Get,
            TunnelOperation::Close => Method::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelOperation::Open => "open",
            TunnelOperation::SendData => "send-data",
            TunnelOperation::ReceiveData => "receive-data",
            TunnelOperation::Close => "close",
        }
    }
}

/// Tunnel id named by a request, if present and non-empty
pub fn extract_tunnel_id(request: &HttpRequest) -> Option<TunnelId> {
    request
        .headers()
        .get(TUNNEL_ID_HEADER)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(TunnelId::from)
}

fn tunnel_request(
    operation: TunnelOperation,
    host: &str,
    tunnel_id: Option<&TunnelId>,
    body: Bytes,
) -> HttpRequest {
    let mut builder = HttpRequest::builder()
        .method(operation.method())
        .uri(TUNNEL_PATH)
        .header("Host", host);

    if let Some(id) = tunnel_id {
        builder = builder.header(TUNNEL_ID_HEADER, id.as_str());
    }
    if !body.is_empty() {
        builder = builder.header("Content-Type", "application/octet-stream");
    }

    builder.body(body).build()
}

pub fn open_tunnel_request(host: &str) -> HttpRequest {
    tunnel_request(TunnelOperation::Open, host, None, Bytes::new())
}

pub fn send_data_request(host: &str, tunnel_id: &TunnelId, data: Bytes) -> HttpRequest {
    tunnel_request(TunnelOperation::SendData, host, Some(tunnel_id), data)
}

pub fn receive_data_request(host: &str, tunnel_id: &TunnelId) -> HttpRequest {
    tunnel_request(TunnelOperation::ReceiveData, host, Some(tunnel_id), Bytes::new())
}

pub fn close_tunnel_request(host: &str, tunnel_id: &TunnelId) -> HttpRequest {
    tunnel_request(TunnelOperation::Close, host, Some(tunnel_id), Bytes::new())
}

/// 200 carrying the newly assigned tunnel id
pub fn tunnel_open_response(tunnel_id: &TunnelId) -> HttpResponse {
    HttpResponse::builder()
        .status(Status::OK)
        .header("Content-Type", "text/plain")
        .body(tunnel_id.as_str().to_string())
        .build()
}

/// 200 with an empty body acknowledging a send
pub fn send_data_response() -> HttpResponse {
    HttpResponse::builder().status(Status::OK).build()
}

/// 200 carrying the bytes buffered for the client, possibly none
///
/// `closed` marks the last response of a tunnel closed by the server.
pub fn receive_data_response(data: Bytes, closed: bool) -> HttpResponse {
    let mut builder = HttpResponse::builder()
        .status(Status::OK)
        .header("Content-Type", "application/octet-stream");
    if closed {
        builder = builder.header(TUNNEL_CLOSED_HEADER, "true");
    }
    builder.body(data).build()
}

/// 200 acknowledging a close; the server drops the connection afterwards
pub fn tunnel_close_response() -> HttpResponse {
    HttpResponse::builder()
        .status(Status::OK)
        .header("Connection", "close")
        .build()
}

/// Error response after which the server drops the connection
pub fn rejection(status: Status, message: &str) -> HttpResponse {
    HttpResponse::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .header("Connection", "close")
        .body(message.to_string())
        .build()
}

/// Whether a receive-data response is the final one of a server-closed tunnel
pub fn is_tunnel_closed(response: &HttpResponse) -> bool {
    response
        .headers()
        .get(TUNNEL_CLOSED_HEADER)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Turn a non-2xx response into `Error::Rejected`
pub fn check_success(response: &HttpResponse) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(Error::Rejected {
        status: response.status().code(),
        message: String::from_utf8_lossy(response.body()).into_owned(),
    })
}

/// Tunnel id from a successful open response
pub fn extract_opened_tunnel_id(response: &HttpResponse) -> Result<TunnelId> {
    check_success(response)?;

    let id = std::str::from_utf8(response.body())
        .map(str::trim)
        .unwrap_or_default();
    if id.is_empty() {
        return Err(Error::Rejected {
            status: response.status().code(),
            message: "open response carried no tunnel id".to_string(),
        });
    }
    Ok(TunnelId::from(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_round_trips_builders() {
        let id = TunnelId::from("t1");
        let cases = [
            (open_tunnel_request("h"), TunnelOperation::Open),
            (
                send_data_request("h", &id, Bytes::from_static(b"x")),
                TunnelOperation::SendData,
            ),
            (receive_data_request("h", &id), TunnelOperation::ReceiveData),
            (close_tunnel_request("h", &id), TunnelOperation::Close),
        ];

        for (request, expected) in cases {
            assert_eq!(TunnelOperation::classify(&request), Some(expected));
        }
    }

    #[test]
    fn test_classify_rejects_other_paths_and_methods() {
        let wrong_path = HttpRequest::builder()
            .method(Method::Get)
            .uri("/index.html")
            .build();
        assert_eq!(TunnelOperation::classify(&wrong_path), None);

        let wrong_method = HttpRequest::builder()
            .method(Method::Patch)
            .uri(TUNNEL_PATH)
            .build();
        assert_eq!(TunnelOperation::classify(&wrong_method), None);

        let with_query = HttpRequest::builder()
            .method(Method::Get)
            .uri("/http-tunnel?cache=1")
            .build();
        assert_eq!(
            TunnelOperation::classify(&with_query),
            Some(TunnelOperation::ReceiveData)
        );
    }

    #[test]
    fn test_extract_tunnel_id() {
        assert_eq!(extract_tunnel_id(&open_tunnel_request("h")), None);

        let request = receive_data_request("h", &TunnelId::from("abc"));
        assert_eq!(extract_tunnel_id(&request), Some(TunnelId::from("abc")));

        let blank = HttpRequest::builder()
            .uri(TUNNEL_PATH)
            .header(TUNNEL_ID_HEADER, "   ")
            .build();
        assert_eq!(extract_tunnel_id(&blank), None);
    }

    #[test]
    fn test_open_response_carries_id() {
        let response = tunnel_open_response(&TunnelId::from("t1"));
        assert_eq!(extract_opened_tunnel_id(&response).unwrap().as_str(), "t1");
    }

    #[test]
    fn test_rejection_closes_connection() {
        let response = rejection(Status::BAD_REQUEST, "no tunnel id specified in request");
        assert!(response.headers().connection_close());

        let err = extract_opened_tunnel_id(&response).unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 400, .. }));
    }

    #[test]
    fn test_closed_marker() {
        assert!(!is_tunnel_closed(&receive_data_response(Bytes::new(), false)));
        assert!(is_tunnel_closed(&receive_data_response(Bytes::new(), true)));
    }
}
