//! HTTP/2 adapter: binds an `h2` session to broker byte streams.
//!
//! The session library owns framing, HPACK, flow control and SETTINGS;
//! this adapter surfaces the session through the typed callback set and the
//! `send_headers`/`send_data`/`ping` operations. Frames leave in the order
//! the session produces them — nothing here re-orders streams — and one
//! connection is owned by exactly one reactor thread: the server future
//! multiplexes its streams cooperatively on that task (no per-stream
//! spawning), so it runs as-is on a reactor's local set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ::h2::{client, server, Ping, PingPong, RecvStream};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::errors::{Error, Result};
use crate::http::{Headers, Request, Response};

/// Frame classes surfaced through the callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Headers,
    Data,
    Ping,
}

/// Typed callback set of the adapter.
#[derive(Default)]
pub struct H2Events {
    pub on_begin_headers: Option<Box<dyn Fn(u32) + Send + Sync>>,
    pub on_header: Option<Box<dyn Fn(u32, &str, &str) + Send + Sync>>,
    pub on_data_chunk: Option<Box<dyn Fn(u32, &[u8]) + Send + Sync>>,
    pub on_frame_recv: Option<Box<dyn Fn(u32, FrameKind) + Send + Sync>>,
    pub on_frame_send: Option<Box<dyn Fn(u32, FrameKind) + Send + Sync>>,
    /// Bytes handed to the session for the wire.
    pub on_send: Option<Box<dyn Fn(u32, usize) + Send + Sync>>,
    /// Stream id plus the final error code (0 = NO_ERROR).
    pub on_stream_close: Option<Box<dyn Fn(u32, u32) + Send + Sync>>,
}

impl H2Events {
    fn begin_headers(&self, sid: u32) {
        if let Some(hook) = &self.on_begin_headers {
            hook(sid);
        }
    }

    fn header(&self, sid: u32, name: &str, value: &str) {
        if let Some(hook) = &self.on_header {
            hook(sid, name, value);
        }
    }

    fn data_chunk(&self, sid: u32, data: &[u8]) {
        if let Some(hook) = &self.on_data_chunk {
            hook(sid, data);
        }
    }

    fn frame_recv(&self, sid: u32, kind: FrameKind) {
        if let Some(hook) = &self.on_frame_recv {
            hook(sid, kind);
        }
    }

    fn frame_send(&self, sid: u32, kind: FrameKind) {
        if let Some(hook) = &self.on_frame_send {
            hook(sid, kind);
        }
    }

    fn sent(&self, sid: u32, bytes: usize) {
        if let Some(hook) = &self.on_send {
            hook(sid, bytes);
        }
    }

    fn stream_close(&self, sid: u32, code: u32) {
        if let Some(hook) = &self.on_stream_close {
            hook(sid, code);
        }
    }
}

/// Per-stream state while a message is in flight.
#[derive(Debug, Default)]
pub struct StreamState {
    pub stream_id: u32,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub end_stream: bool,
}

/// Serves one HTTP/2 connection: every completed request stream is answered
/// through `handler`.
///
/// Streams multiplex cooperatively inside this future; nothing is spawned,
/// so the connection stays owned by the task (and thread) that polls it.
pub async fn serve<S, F>(io: S, events: Arc<H2Events>, handler: F) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(u32, Request) -> Response + Send + Sync + Clone + 'static,
{
    let mut connection = server::handshake(io)
        .await
        .map_err(|e| Error::protocol(format!("h2 handshake: {e}")))?;
    debug!("h2 server session open");

    let states: Arc<Mutex<HashMap<u32, StreamState>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            inbound = connection.accept() => match inbound {
                Some(Ok((request, respond))) => {
                    in_flight.push(serve_stream(
                        request,
                        respond,
                        Arc::clone(&events),
                        handler.clone(),
                        Arc::clone(&states),
                    ));
                }
                Some(Err(err)) => {
                    return Err(Error::protocol(format!("h2 accept: {err}")));
                }
                None => break,
            },
            Some(finished) = in_flight.next() => {
                if let Err(err) = finished {
                    warn!("h2 stream failed: {err}");
                }
            }
        }
    }
    // The peer is done opening streams; drain what is still in flight.
    while let Some(finished) = in_flight.next().await {
        if let Err(err) = finished {
            warn!("h2 stream failed: {err}");
        }
    }
    Ok(())
}

async fn serve_stream<F>(
    request: ::http::Request<RecvStream>,
    mut respond: server::SendResponse<Bytes>,
    events: Arc<H2Events>,
    handler: F,
    states: Arc<Mutex<HashMap<u32, StreamState>>>,
) -> Result<()>
where
    F: Fn(u32, Request) -> Response,
{
    let sid = u32::from(respond.stream_id());
    events.begin_headers(sid);
    events.frame_recv(sid, FrameKind::Headers);

    let (parts, mut body) = request.into_parts();
    let mut message = Request::new(
        parts.method.as_str().to_string(),
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
    );
    for (name, value) in parts.headers.iter() {
        let value = value.to_str().unwrap_or_default();
        events.header(sid, name.as_str(), value);
        message.headers.insert(name.as_str(), value.to_string());
    }
    states.lock().expect("h2 state lock poisoned").insert(
        sid,
        StreamState {
            stream_id: sid,
            headers: message.headers.clone(),
            body: Vec::new(),
            end_stream: false,
        },
    );

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| Error::protocol(format!("h2 body: {e}")))?;
        events.frame_recv(sid, FrameKind::Data);
        events.data_chunk(sid, &chunk);
        message.body.extend_from_slice(&chunk);
        if let Some(state) = states
            .lock()
            .expect("h2 state lock poisoned")
            .get_mut(&sid)
        {
            state.body.extend_from_slice(&chunk);
        }
        // Hand the window back so the peer keeps sending.
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    if let Some(state) = states
        .lock()
        .expect("h2 state lock poisoned")
        .get_mut(&sid)
    {
        state.end_stream = true;
    }

    let answer = handler(sid, message);
    let mut builder = ::http::Response::builder().status(answer.status);
    for (name, value) in answer.headers.iter() {
        builder = builder.header(name, value);
    }
    let wire = builder
        .body(())
        .map_err(|e| Error::protocol(format!("h2 response head: {e}")))?;

    let body = Bytes::from(answer.body);
    let end_on_headers = body.is_empty();
    let mut stream = respond
        .send_response(wire, end_on_headers)
        .map_err(|e| Error::protocol(format!("h2 send response: {e}")))?;
    events.frame_send(sid, FrameKind::Headers);
    if !end_on_headers {
        let sent = body.len();
        stream
            .send_data(body, true)
            .map_err(|e| Error::protocol(format!("h2 send data: {e}")))?;
        events.frame_send(sid, FrameKind::Data);
        events.sent(sid, sent);
    }

    states.lock().expect("h2 state lock poisoned").remove(&sid);
    events.stream_close(sid, 0);
    trace!(sid, "h2 stream answered");
    Ok(())
}

/// Client half of the adapter.
pub struct H2Client {
    send: client::SendRequest<Bytes>,
    ping_pong: Option<PingPong>,
    events: Arc<H2Events>,
}

impl H2Client {
    /// Performs the client handshake and spawns the connection driver onto
    /// the current runtime — on a reactor's current-thread runtime the
    /// driver shares the reactor thread.
    pub async fn connect<S>(io: S, events: Arc<H2Events>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send, mut connection) = client::handshake(io)
            .await
            .map_err(|e| Error::protocol(format!("h2 handshake: {e}")))?;
        let ping_pong = connection.ping_pong();
        tokio::spawn(async move {
            if let Err(err) = (&mut connection).await {
                warn!("h2 connection driver ended: {err}");
            }
        });
        debug!("h2 client session open");
        Ok(Self {
            send,
            ping_pong,
            events,
        })
    }

    /// Sends a full request: headers (`send_headers`), then the body
    /// (`send_data`) when present, and collects the peer's answer.
    pub async fn request(&mut self, message: Request) -> Result<Response> {
        let mut builder = ::http::Request::builder()
            .method(message.method.as_str())
            .uri(message.target.as_str());
        for (name, value) in message.headers.iter() {
            builder = builder.header(name, value);
        }
        let wire = builder
            .body(())
            .map_err(|e| Error::protocol(format!("h2 request head: {e}")))?;

        let end_on_headers = message.body.is_empty();
        let send = self
            .send
            .clone()
            .ready()
            .await
            .map_err(|e| Error::protocol(format!("h2 not ready: {e}")))?;
        let (response, mut stream) = {
            let mut send = send;
            send.send_request(wire, end_on_headers)
                .map_err(|e| Error::protocol(format!("h2 send request: {e}")))?
        };
        let sid = u32::from(stream.stream_id());
        self.events.frame_send(sid, FrameKind::Headers);
        if !end_on_headers {
            let body = Bytes::from(message.body);
            let sent = body.len();
            stream
                .send_data(body, true)
                .map_err(|e| Error::protocol(format!("h2 send data: {e}")))?;
            self.events.frame_send(sid, FrameKind::Data);
            self.events.sent(sid, sent);
        }

        let response = response
            .await
            .map_err(|e| Error::protocol(format!("h2 response: {e}")))?;
        self.events.begin_headers(sid);
        events_from_response(&self.events, sid, &response);
        let (parts, mut body) = response.into_parts();
        let mut answer = Response::new(parts.status.as_u16(), "");
        for (name, value) in parts.headers.iter() {
            answer
                .headers
                .insert(name.as_str(), value.to_str().unwrap_or_default().to_string());
        }
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| Error::protocol(format!("h2 body: {e}")))?;
            self.events.frame_recv(sid, FrameKind::Data);
            self.events.data_chunk(sid, &chunk);
            answer.body.extend_from_slice(&chunk);
            let _ = body.flow_control().release_capacity(chunk.len());
        }
        self.events.stream_close(sid, 0);
        Ok(answer)
    }

    /// Sends an unsolicited PING and waits for the acknowledgement.
    pub async fn ping(&mut self) -> Result<()> {
        let ping_pong = self
            .ping_pong
            .as_mut()
            .ok_or_else(|| Error::protocol("ping surface already taken"))?;
        ping_pong
            .ping(Ping::opaque())
            .await
            .map_err(|e| Error::protocol(format!("h2 ping: {e}")))?;
        self.events.frame_recv(0, FrameKind::Ping);
        Ok(())
    }
}

fn events_from_response(events: &H2Events, sid: u32, response: &::http::Response<RecvStream>) {
    events.frame_recv(sid, FrameKind::Headers);
    for (name, value) in response.headers().iter() {
        events.header(sid, name.as_str(), value.to_str().unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn request_response_over_a_duplex_pipe() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let closes = Arc::new(AtomicU32::new(0));
        let server_closes = Arc::clone(&closes);
        let server_events = Arc::new(H2Events {
            on_stream_close: Some(Box::new(move |_, code| {
                assert_eq!(code, 0);
                server_closes.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        tokio::spawn(async move {
            let _ = serve(server_io, server_events, |_sid, request| {
                assert_eq!(request.method, "POST");
                assert_eq!(request.body, b"marco");
                let mut response = Response::new(200, "");
                response.headers.insert("x-answer", "polo");
                response.body = b"polo".to_vec();
                response
            })
            .await;
        });

        let mut client = H2Client::connect(client_io, Arc::new(H2Events::default()))
            .await
            .unwrap();
        let mut request = Request::new("POST", "https://h2.test/echo");
        request.body = b"marco".to_vec();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-answer"), Some("polo"));
        assert_eq!(response.body, b"polo");
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = serve(server_io, Arc::new(H2Events::default()), |_, _| {
                Response::new(200, "")
            })
            .await;
        });
        let mut client = H2Client::connect(client_io, Arc::new(H2Events::default()))
            .await
            .unwrap();
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn data_chunks_reach_the_callback() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let server_events = Arc::new(H2Events {
            on_data_chunk: Some(Box::new(move |_, chunk| {
                sink.lock().unwrap().extend_from_slice(chunk);
            })),
            ..Default::default()
        });
        tokio::spawn(async move {
            let _ = serve(server_io, server_events, |_, _| Response::new(204, ""))
                .await;
        });

        let mut client = H2Client::connect(client_io, Arc::new(H2Events::default()))
            .await
            .unwrap();
        let mut request = Request::new("PUT", "https://h2.test/upload");
        request.body = vec![7u8; 3000];
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(seen.lock().unwrap().len(), 3000);
    }
}
