//! In-process WebSocket agent used by the integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};
use voxlive::Envelope;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Local agent accepting any number of WebSocket connections.
pub struct TestServer {
    pub endpoint: String,
    connections: mpsc::UnboundedReceiver<ServerConn>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws/live", listener.local_addr().unwrap());
        let (tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        tx.send(ServerConn { ws }).ok();
                    }
                });
            }
        });

        Self {
            endpoint,
            connections,
            task,
        }
    }

    /// Next accepted connection; panics if none arrives in time.
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("server stopped")
    }

    /// True if no client connects within `window`.
    pub async fn no_connection_within(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.connections.recv())
            .await
            .is_err()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Server side of one client connection. Dropping it resets the socket.
pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send(&mut self, envelope: &Envelope) {
        self.send_text(&envelope.to_json().unwrap()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next envelope from the client, or `None` once it closes.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let next = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .expect("client sent nothing in time");
            match next {
                Some(Ok(Message::Text(text))) => return Some(Envelope::from_json(&text).unwrap()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// Collect envelopes until the client stays silent for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(Some(Ok(message))) = tokio::time::timeout(quiet, self.ws.next()).await {
            if let Message::Text(text) = message {
                envelopes.push(Envelope::from_json(&text).unwrap());
            }
        }
        envelopes
    }

    /// Wait for the client's close frame and return its code.
    pub async fn recv_close_code(&mut self) -> Option<u16> {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            match tokio::time::timeout(TIMEOUT, self.ws.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
                Ok(Some(Ok(_))) => {}
                _ => return None,
            }
        }
        None
    }

    /// Close the connection with the given code and reason.
    pub async fn close_with(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.ws.close(Some(frame)).await.ok();
    }
}

/// Raw TCP listener that answers every handshake with an HTTP error.
pub async fn rejecting_server(status_line: &'static str) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/ws/live", listener.local_addr().unwrap());
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = [0u8; 1024];
            stream.read(&mut request).await.ok();
            let response = format!("{}\r\nContent-Length: 0\r\n\r\n", status_line);
            stream.write_all(response.as_bytes()).await.ok();
            stream.shutdown().await.ok();
        }
    });
    (endpoint, task)
}

/// Poll `done` until it holds or the test timeout elapses.
pub async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}
