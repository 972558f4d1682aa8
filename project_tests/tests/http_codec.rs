//! HTTP/1 codec scenarios across serializer and parser.

use wharf::hash::{Compressor, Method};
use wharf::http::{
    chunk_bytes, request_bytes, response_bytes, Event, Kind, Parser, Request, Response,
};

#[test]
fn serialized_requests_parse_back() {
    let mut request = Request::new("POST", "/submit?x=1");
    request.headers.insert("Host", "svc.local");
    request.headers.insert("Content-Type", "text/plain");
    request.body = b"forty two".to_vec();

    let wire = request_bytes(&request);
    let mut parser = Parser::new(Kind::Request);
    let (used, events) = parser.feed(&wire).unwrap();
    assert_eq!(used, wire.len());
    assert!(parser.is_done());
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Request(m, t, _) if m == "POST" && t == "/submit?x=1")));
    assert!(events.contains(&Event::Chunk(b"forty two".to_vec())));
}

#[test]
fn chunked_responses_stream_through_the_sub_machine() {
    let mut head = Response::new(200, "OK");
    head.headers.insert("Transfer-Encoding", "chunked");
    let mut wire = response_bytes(&head);
    for part in [&b"alpha"[..], &b"beta"[..], &b""[..]] {
        wire.extend(chunk_bytes(part));
    }

    let mut parser = Parser::new(Kind::Response);
    let mut body = Vec::new();
    let (used, events) = parser.feed(&wire).unwrap();
    assert_eq!(used, wire.len());
    for event in events {
        if let Event::Chunk(chunk) = event {
            body.extend(chunk);
        }
    }
    assert_eq!(body, b"alphabeta");
    assert!(parser.is_done());
    assert!(parser.keep_alive());
}

#[test]
fn compressed_bodies_reach_the_consumer_decoded() {
    let plain = b"the same phrase again and again and again and again";
    for method in [Method::Gzip, Method::Brotli, Method::Zstd] {
        let packed = Compressor::default().compress(plain, method).unwrap();
        let mut response = Response::new(200, "OK");
        response
            .headers
            .insert("Content-Encoding", method.token());
        response.body = packed;
        let wire = response_bytes(&response);

        let mut parser = Parser::new(Kind::Response);
        let (_, events) = parser.feed(&wire).unwrap();
        assert!(
            events.contains(&Event::Chunk(plain.to_vec())),
            "{method:?} body did not decode"
        );
    }
}

#[test]
fn connection_close_bounds_keep_alive() {
    let mut parser = Parser::new(Kind::Response);
    parser
        .feed(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    assert!(!parser.keep_alive());

    let mut parser = Parser::new(Kind::Response);
    parser
        .feed(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    assert!(!parser.keep_alive());
}
