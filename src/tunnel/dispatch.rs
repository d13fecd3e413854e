//! Request dispatch
//!
//! Maps one HTTP request onto one message switch operation and builds the
//! response. The dispatcher keeps no state between requests.

use super::message::{self, TunnelOperation};
use super::switch::{MessageSwitch, PendingPoll, PollReply};
use super::{Error, TunnelId};
use crate::http::{self, HttpRequest, HttpResponse, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a request is answered
#[derive(Debug)]
pub enum Reply {
    /// Respond now; `close` drops the connection after the response
    Immediate { response: HttpResponse, close: bool },
    /// Respond once the parked poll is answered
    Deferred(PendingPoll),
}

impl Reply {
    fn respond(response: HttpResponse) -> Self {
        Reply::Immediate {
            response,
            close: false,
        }
    }

    fn respond_and_close(response: HttpResponse) -> Self {
        Reply::Immediate {
            response,
            close: true,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Reply::Deferred(_))
    }

    /// Produce the response, blocking on a deferred poll
    ///
    /// Returns the response and whether the connection must be closed
    /// after it is sent. A deferred poll is committed right away.
    pub fn resolve(self) -> (HttpResponse, bool) {
        match self {
            Reply::Immediate { response, close } => (response, close),
            Reply::Deferred(poll) => (poll_response(poll.wait()), false),
        }
    }
}

/// Response carrying a poll reply
pub fn poll_response(reply: PollReply) -> HttpResponse {
    let (data, closed) = reply.into_parts();
    message::receive_data_response(data, closed)
}

/// Per-connection adapter from HTTP requests to the message switch
pub struct RequestDispatcher {
    switch: Arc<MessageSwitch>,
    remote_addr: Option<SocketAddr>,
}

impl RequestDispatcher {
    pub fn new(switch: Arc<MessageSwitch>, remote_addr: Option<SocketAddr>) -> Self {
        RequestDispatcher {
            switch,
            remote_addr,
        }
    }

    pub fn dispatch(&self, request: HttpRequest) -> Reply {
        match TunnelOperation::classify(&request) {
            Some(TunnelOperation::Open) => self.open_tunnel(&request),
            Some(TunnelOperation::SendData) => self.send_data(request),
            Some(TunnelOperation::ReceiveData) => self.receive_data(&request),
            Some(TunnelOperation::Close) => self.close_tunnel(&request),
            None => self.reject(
                &request,
                Status::BAD_REQUEST,
                "invalid request to HTTP tunnel gateway",
            ),
        }
    }

    /// Response for a request that failed to parse
    pub fn reject_malformed(&self, err: &http::Error) -> HttpResponse {
        let status = match err {
            http::Error::BodyTooLarge { .. } => Status::PAYLOAD_TOO_LARGE,
            _ => Status::BAD_REQUEST,
        };
        warn!(remote = ?self.remote_addr, error = %err, "rejecting malformed request");
        message::rejection(status, &err.to_string())
    }

    fn open_tunnel(&self, request: &HttpRequest) -> Reply {
        match self.switch.create_tunnel(self.remote_addr) {
            Ok(tunnel_id) => {
                debug!(
                    remote = ?self.remote_addr,
                    tunnel = %tunnel_id,
                    "open tunnel request"
                );
                Reply::respond(message::tunnel_open_response(&tunnel_id))
            }
            Err(_) => self.reject(
                request,
                Status::SERVICE_UNAVAILABLE,
                "tunnel server is not accepting tunnels",
            ),
        }
    }

    fn send_data(&self, mut request: HttpRequest) -> Reply {
        let tunnel_id = match self.check_tunnel_id(&request, MessageSwitch::is_open_tunnel) {
            Ok(tunnel_id) => tunnel_id,
            Err(rejection) => return rejection,
        };
        debug!(tunnel = %tunnel_id, bytes = request.body().len(), "send data request");

        if request.body().is_empty() {
            return self.reject(
                &request,
                Status::BAD_REQUEST,
                "send data requests must contain data",
            );
        }

        self.switch
            .route_inbound_data(&tunnel_id, request.take_body());
        Reply::respond(message::send_data_response())
    }

    fn receive_data(&self, request: &HttpRequest) -> Reply {
        let tunnel_id = match self.check_tunnel_id(request, MessageSwitch::is_live_tunnel) {
            Ok(tunnel_id) => tunnel_id,
            Err(rejection) => return rejection,
        };
        debug!(tunnel = %tunnel_id, "poll data request");

        match self.switch.poll_outbound_data(&tunnel_id) {
            Ok(poll) => Reply::Deferred(poll),
            Err(Error::PollPending(_)) => self.reject(
                request,
                Status::CONFLICT,
                "a poll is already pending for this tunnel",
            ),
            Err(_) => self.reject(
                request,
                Status::BAD_REQUEST,
                "specified tunnel is either closed or does not exist",
            ),
        }
    }

    fn close_tunnel(&self, request: &HttpRequest) -> Reply {
        let tunnel_id = match self.check_tunnel_id(request, MessageSwitch::is_live_tunnel) {
            Ok(tunnel_id) => tunnel_id,
            Err(rejection) => return rejection,
        };
        debug!(tunnel = %tunnel_id, "close tunnel request");

        self.switch.client_close_tunnel(&tunnel_id);
        Reply::respond_and_close(message::tunnel_close_response())
    }

    /// Extract the tunnel id and check it against the switch, producing the
    /// rejection to send if either fails
    fn check_tunnel_id(
        &self,
        request: &HttpRequest,
        accepts: fn(&MessageSwitch, &TunnelId) -> bool,
    ) -> std::result::Result<TunnelId, Reply> {
        let Some(tunnel_id) = message::extract_tunnel_id(request) else {
            return Err(self.reject(
                request,
                Status::BAD_REQUEST,
                "no tunnel id specified in request",
            ));
        };

        if !accepts(&self.switch, &tunnel_id) {
            return Err(self.reject(
                request,
                Status::BAD_REQUEST,
                "specified tunnel is either closed or does not exist",
            ));
        }
        Ok(tunnel_id)
    }

    fn reject(&self, request: &HttpRequest, status: Status, reason: &str) -> Reply {
        let tunnel = message::extract_tunnel_id(request);
        warn!(
            remote = ?self.remote_addr,
            tunnel = tunnel.as_ref().map_or("<unknown>", TunnelId::as_str),
            method = %request.method(),
            status = status.code(),
            reason,
            "rejecting request"
        );
        Reply::respond_and_close(message::rejection(status, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::tunnel::{PollReply, TunnelAcceptor, TunnelConfig};
    use bytes::Bytes;
    use std::time::Duration;

    fn dispatcher() -> (RequestDispatcher, Arc<MessageSwitch>, TunnelAcceptor) {
        let config = TunnelConfig::builder()
            .poll_timeout(Duration::from_millis(50))
            .idle_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let (switch, acceptor) = MessageSwitch::new(config);
        let dispatcher = RequestDispatcher::new(switch.clone(), "127.0.0.1:4000".parse().ok());
        (dispatcher, switch, acceptor)
    }

    fn immediate(reply: Reply) -> (HttpResponse, bool) {
        assert!(!reply.is_deferred());
        reply.resolve()
    }

    fn open(dispatcher: &RequestDispatcher) -> TunnelId {
        let (response, close) = immediate(dispatcher.dispatch(message::open_tunnel_request("h")));
        assert!(!close);
        message::extract_opened_tunnel_id(&response).unwrap()
    }

    #[test]
    fn test_open_records_remote_address() {
        let (dispatcher, switch, acceptor) = dispatcher();
        let id = open(&dispatcher);

        assert!(switch.is_open_tunnel(&id));
        let tunnel = acceptor.try_accept().unwrap();
        assert_eq!(tunnel.remote_addr(), "127.0.0.1:4000".parse().ok());
    }

    #[test]
    fn test_open_rejected_without_acceptor() {
        let (dispatcher, switch, acceptor) = dispatcher();
        drop(acceptor);

        let (response, close) = immediate(dispatcher.dispatch(message::open_tunnel_request("h")));
        assert_eq!(response.status(), Status::SERVICE_UNAVAILABLE);
        assert!(close);
        assert_eq!(switch.tunnel_count(), 0);
    }

    #[test]
    fn test_send_then_poll() {
        let (dispatcher, _switch, acceptor) = dispatcher();
        let id = open(&dispatcher);
        let tunnel = acceptor.try_accept().unwrap();

        let send = message::send_data_request("h", &id, Bytes::from_static(b"hello"));
        let (response, close) = immediate(dispatcher.dispatch(send));
        assert_eq!(response.status(), Status::OK);
        assert!(response.body().is_empty());
        assert!(!close);
        assert_eq!(tunnel.read().unwrap().as_ref(), b"hello");

        let reply = dispatcher.dispatch(message::receive_data_request("h", &id));
        assert!(reply.is_deferred());
        tunnel.write(&b"world"[..]);
        let (response, close) = reply.resolve();
        assert_eq!(response.body().as_ref(), b"world");
        assert!(!message::is_tunnel_closed(&response));
        assert!(!close);
    }

    #[test]
    fn test_poll_timeout_answers_empty() {
        let (dispatcher, _switch, _acceptor) = dispatcher();
        let id = open(&dispatcher);

        let (response, close) = dispatcher
            .dispatch(message::receive_data_request("h", &id))
            .resolve();
        assert_eq!(response.status(), Status::OK);
        assert!(response.body().is_empty());
        assert!(!close);
    }

    #[test]
    fn test_empty_send_rejected_without_side_effects() {
        let (dispatcher, _switch, acceptor) = dispatcher();
        let id = open(&dispatcher);
        let tunnel = acceptor.try_accept().unwrap();

        let send = message::send_data_request("h", &id, Bytes::new());
        let (response, close) = immediate(dispatcher.dispatch(send));
        assert_eq!(response.status(), Status::BAD_REQUEST);
        assert!(close);
        assert!(response.headers().connection_close());
        assert!(matches!(
            tunnel.read_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_unknown_tunnel_rejected_without_creating_state() {
        let (dispatcher, switch, _acceptor) = dispatcher();
        let ghost = TunnelId::from("ghost");

        let (response, close) =
            immediate(dispatcher.dispatch(message::receive_data_request("h", &ghost)));
        assert_eq!(response.status(), Status::BAD_REQUEST);
        assert!(close);
        assert_eq!(switch.tunnel_count(), 0);
    }

    #[test]
    fn test_missing_tunnel_id_rejected() {
        let (dispatcher, _switch, _acceptor) = dispatcher();
        let request = HttpRequest::builder()
            .method(Method::Put)
            .uri(message::TUNNEL_PATH)
            .body("data")
            .build();

        let (response, close) = immediate(dispatcher.dispatch(request));
        assert_eq!(response.status(), Status::BAD_REQUEST);
        assert!(close);
    }

    #[test]
    fn test_unrecognized_request_rejected() {
        let (dispatcher, _switch, _acceptor) = dispatcher();
        let request = HttpRequest::builder()
            .method(Method::Get)
            .uri("/favicon.ico")
            .build();

        let (response, close) = immediate(dispatcher.dispatch(request));
        assert_eq!(response.status(), Status::BAD_REQUEST);
        assert!(close);
    }

    #[test]
    fn test_second_poll_conflicts() {
        let (dispatcher, switch, acceptor) = dispatcher();
        let id = open(&dispatcher);
        let tunnel = acceptor.try_accept().unwrap();

        let first = dispatcher.dispatch(message::receive_data_request("h", &id));
        assert!(first.is_deferred());

        let (response, close) =
            immediate(dispatcher.dispatch(message::receive_data_request("h", &id)));
        assert_eq!(response.status(), Status::CONFLICT);
        assert!(close);
        assert!(switch.is_open_tunnel(&id));

        tunnel.write(&b"still here"[..]);
        let (response, _) = first.resolve();
        assert_eq!(response.body().as_ref(), b"still here");
    }

    #[test]
    fn test_close_releases_poll_and_closes_connection() {
        let (dispatcher, switch, _acceptor) = dispatcher();
        let id = open(&dispatcher);

        let poll = dispatcher.dispatch(message::receive_data_request("h", &id));
        let (response, close) =
            immediate(dispatcher.dispatch(message::close_tunnel_request("h", &id)));
        assert_eq!(response.status(), Status::OK);
        assert!(close);
        assert!(!switch.is_open_tunnel(&id));

        let (response, _) = poll.resolve();
        assert!(message::is_tunnel_closed(&response));

        let (response, close) =
            immediate(dispatcher.dispatch(message::close_tunnel_request("h", &id)));
        assert_eq!(response.status(), Status::BAD_REQUEST);
        assert!(close);
    }

    #[test]
    fn test_application_close_marks_final_poll() {
        let (dispatcher, _switch, acceptor) = dispatcher();
        let id = open(&dispatcher);
        let tunnel = acceptor.try_accept().unwrap();

        tunnel.write(&b"last words"[..]);
        tunnel.close();

        let send = message::send_data_request("h", &id, Bytes::from_static(b"late"));
        let (response, _) = immediate(dispatcher.dispatch(send));
        assert_eq!(response.status(), Status::BAD_REQUEST);

        let (response, close) = dispatcher
            .dispatch(message::receive_data_request("h", &id))
            .resolve();
        assert_eq!(response.body().as_ref(), b"last words");
        assert!(message::is_tunnel_closed(&response));
        assert!(!close);
    }

    #[test]
    fn test_reject_malformed() {
        let (dispatcher, _switch, _acceptor) = dispatcher();

        let too_large = http::Error::BodyTooLarge {
            declared: 10,
            limit: 5,
        };
        let response = dispatcher.reject_malformed(&too_large);
        assert_eq!(response.status(), Status::PAYLOAD_TOO_LARGE);
        assert!(response.headers().connection_close());

        let garbage = http::Error::Parse("bad request line".to_string());
        assert_eq!(
            dispatcher.reject_malformed(&garbage).status(),
            Status::BAD_REQUEST
        );
    }

    #[test]
    fn test_poll_reply_parts() {
        assert_eq!(
            PollReply::Closed(Bytes::from_static(b"x")).into_parts(),
            (Bytes::from_static(b"x"), true)
        );
    }
}
