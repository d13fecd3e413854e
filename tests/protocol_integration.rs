//! Integration tests for the tunnel wire protocol
//!
//! These tests drive a running tunnel server with plain HTTP exchanges.

use bytes::Bytes;
use httptunnel::http::session::FdSessionOps;
use httptunnel::http::{self, HttpClient, HttpRequest, Method, Status};
use httptunnel::net;
use httptunnel::tunnel::message::{self, TUNNEL_ID_HEADER, TUNNEL_PATH};
use httptunnel::tunnel::{ServerHandle, TunnelAcceptor, TunnelConfig, TunnelId, TunnelServer};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

fn start_server(poll_timeout: Duration) -> (ServerHandle, TunnelAcceptor) {
    let config = TunnelConfig::builder()
        .poll_timeout(poll_timeout)
        .idle_timeout(Duration::from_secs(30))
        .split_threshold(1024)
        .max_content_length(4096)
        .build()
        .unwrap();
    let (server, acceptor) = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
    (server.spawn().unwrap(), acceptor)
}

fn connect(addr: SocketAddr) -> HttpClient<FdSessionOps> {
    let stream = net::connect(addr, Duration::from_secs(1)).unwrap();
    HttpClient::new(FdSessionOps::new(stream))
}

fn open_tunnel(client: &mut HttpClient<FdSessionOps>) -> TunnelId {
    let response = client.exchange(&message::open_tunnel_request("test")).unwrap();
    assert_eq!(response.status(), Status::OK);
    assert_eq!(response.headers().get("Content-Type"), Some("text/plain"));
    message::extract_opened_tunnel_id(&response).unwrap()
}

fn assert_connection_closed(client: &mut HttpClient<FdSessionOps>) {
    assert!(matches!(
        client.receive_response(),
        Err(http::Error::ConnectionClosed)
    ));
}

#[test]
fn test_poll_receives_bytes_written_after_it() {
    let (handle, acceptor) = start_server(Duration::from_secs(5));
    let mut control = connect(handle.local_addr());
    let id = open_tunnel(&mut control);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    let response = control
        .exchange(&message::send_data_request("test", &id, Bytes::from_static(b"hello")))
        .unwrap();
    assert_eq!(response.status(), Status::OK);
    assert!(response.body().is_empty());
    assert_eq!(tunnel.read().unwrap().as_ref(), b"hello");

    let poll_addr = handle.local_addr();
    let poll_id = id.clone();
    let poller = thread::spawn(move || {
        let mut poller = connect(poll_addr);
        poller
            .exchange(&message::receive_data_request("test", &poll_id))
            .unwrap()
    });

    thread::sleep(Duration::from_millis(100));
    tunnel.write(&b"world"[..]).wait().unwrap();

    let response = poller.join().unwrap();
    assert_eq!(response.status(), Status::OK);
    assert_eq!(response.body().as_ref(), b"world");
    assert!(!message::is_tunnel_closed(&response));
}

#[test]
fn test_empty_send_rejected() {
    let (handle, acceptor) = start_server(Duration::from_secs(5));
    let mut client = connect(handle.local_addr());
    let id = open_tunnel(&mut client);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    let response = client
        .exchange(&message::send_data_request("test", &id, Bytes::new()))
        .unwrap();
    assert_eq!(response.status(), Status::BAD_REQUEST);
    assert!(response.headers().connection_close());
    assert_connection_closed(&mut client);

    assert!(tunnel.read_timeout(Duration::from_millis(50)).is_err());
    assert!(handle.switch().is_open_tunnel(&id));
}

#[test]
fn test_poll_on_unknown_tunnel_rejected() {
    let (handle, _acceptor) = start_server(Duration::from_secs(5));
    let mut client = connect(handle.local_addr());

    let response = client
        .exchange(&message::receive_data_request("test", &TunnelId::from("guess")))
        .unwrap();
    assert_eq!(response.status(), Status::BAD_REQUEST);
    assert_connection_closed(&mut client);
    assert_eq!(handle.switch().tunnel_count(), 0);
}

#[test]
fn test_unrecognized_request_rejected() {
    let (handle, _acceptor) = start_server(Duration::from_secs(5));
    let mut client = connect(handle.local_addr());

    let request = HttpRequest::builder()
        .method(Method::Get)
        .uri("/index.html")
        .header("Host", "test")
        .build();
    let response = client.exchange(&request).unwrap();
    assert_eq!(response.status(), Status::BAD_REQUEST);
    assert_connection_closed(&mut client);
}

#[test]
fn test_poll_timeout_returns_empty_body() {
    let (handle, _acceptor) = start_server(Duration::from_millis(100));
    let mut client = connect(handle.local_addr());
    let id = open_tunnel(&mut client);

    let start = Instant::now();
    let response = client
        .exchange(&message::receive_data_request("test", &id))
        .unwrap();
    assert_eq!(response.status(), Status::OK);
    assert!(response.body().is_empty());
    assert!(start.elapsed() >= Duration::from_millis(100));

    // The connection stays usable for the next poll.
    let response = client
        .exchange(&message::receive_data_request("test", &id))
        .unwrap();
    assert_eq!(response.status(), Status::OK);
}

#[test]
fn test_concurrent_poll_conflicts() {
    let (handle, acceptor) = start_server(Duration::from_secs(5));
    let mut control = connect(handle.local_addr());
    let id = open_tunnel(&mut control);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    let addr = handle.local_addr();
    let first_id = id.clone();
    let first = thread::spawn(move || {
        let mut client = connect(addr);
        client
            .exchange(&message::receive_data_request("test", &first_id))
            .unwrap()
    });
    thread::sleep(Duration::from_millis(100));

    let mut second = connect(addr);
    let response = second
        .exchange(&message::receive_data_request("test", &id))
        .unwrap();
    assert_eq!(response.status(), Status::CONFLICT);
    assert_connection_closed(&mut second);

    tunnel.write(&b"for the first"[..]);
    let response = first.join().unwrap();
    assert_eq!(response.body().as_ref(), b"for the first");
}

#[test]
fn test_close_releases_pending_poll() {
    let (handle, _acceptor) = start_server(Duration::from_secs(10));
    let mut control = connect(handle.local_addr());
    let id = open_tunnel(&mut control);

    let addr = handle.local_addr();
    let poll_id = id.clone();
    let poller = thread::spawn(move || {
        let mut client = connect(addr);
        let start = Instant::now();
        let response = client
            .exchange(&message::receive_data_request("test", &poll_id))
            .unwrap();
        (response, start.elapsed())
    });
    thread::sleep(Duration::from_millis(100));

    let response = control
        .exchange(&message::close_tunnel_request("test", &id))
        .unwrap();
    assert_eq!(response.status(), Status::OK);
    assert!(response.headers().connection_close());
    assert_connection_closed(&mut control);

    let (response, elapsed) = poller.join().unwrap();
    assert!(message::is_tunnel_closed(&response));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_oversized_send_rejected_before_body() {
    let (handle, acceptor) = start_server(Duration::from_secs(5));
    let mut control = connect(handle.local_addr());
    let id = open_tunnel(&mut control);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let head = format!(
        "PUT {} HTTP/1.1\r\nHost: test\r\n{}: {}\r\nContent-Length: 1000000\r\n\r\n",
        TUNNEL_PATH, TUNNEL_ID_HEADER, id
    );
    stream.write_all(head.as_bytes()).unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 413"), "unexpected reply: {reply}");
    assert!(tunnel.read_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_pipelined_requests() {
    let (handle, acceptor) = start_server(Duration::from_secs(5));
    let mut client = connect(handle.local_addr());
    let id = open_tunnel(&mut client);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    let first = message::send_data_request("test", &id, Bytes::from_static(b"one "));
    let second = message::send_data_request("test", &id, Bytes::from_static(b"two"));
    client.send_request(&first).unwrap();
    client.send_request(&second).unwrap();

    assert_eq!(client.receive_response().unwrap().status(), Status::OK);
    assert_eq!(client.receive_response().unwrap().status(), Status::OK);

    let mut received = Vec::new();
    while received.len() < 7 {
        received.extend_from_slice(&tunnel.read().unwrap());
    }
    assert_eq!(received, b"one two");
}

#[test]
fn test_application_close_reaches_client() {
    let (handle, acceptor) = start_server(Duration::from_secs(5));
    let mut client = connect(handle.local_addr());
    let id = open_tunnel(&mut client);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    tunnel.write(&b"goodbye"[..]);
    drop(tunnel);

    let response = client
        .exchange(&message::receive_data_request("test", &id))
        .unwrap();
    assert_eq!(response.body().as_ref(), b"goodbye");
    assert!(message::is_tunnel_closed(&response));

    let response = client
        .exchange(&message::receive_data_request("test", &id))
        .unwrap();
    assert_eq!(response.status(), Status::BAD_REQUEST);
}

#[test]
fn test_abandoned_poll_frees_slot_and_keeps_bytes() {
    let (handle, acceptor) = start_server(Duration::from_secs(10));
    let mut control = connect(handle.local_addr());
    let id = open_tunnel(&mut control);
    let tunnel = acceptor.accept_timeout(Duration::from_secs(1)).unwrap();

    let mut abandoned = connect(handle.local_addr());
    abandoned
        .send_request(&message::receive_data_request("test", &id))
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    drop(abandoned);
    thread::sleep(Duration::from_millis(300));

    let written = tunnel.write(&b"precious"[..]);
    assert!(!written.is_done());

    let mut poller = connect(handle.local_addr());
    let start = Instant::now();
    let response = poller
        .exchange(&message::receive_data_request("test", &id))
        .unwrap();
    assert_eq!(response.status(), Status::OK);
    assert_eq!(response.body().as_ref(), b"precious");
    assert!(start.elapsed() < Duration::from_secs(5));
    written.wait_timeout(Duration::from_secs(1)).unwrap();
}
