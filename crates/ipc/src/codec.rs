//! Framing helpers.
//!
//! Each message is a 4-byte big-endian length prefix followed by a JSON
//! payload, carried by `tokio_util`'s length-delimited codec.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::ProtocolError;

pub type FramedSocket = Framed<UnixStream, LengthDelimitedCodec>;

/// Wrap a connected stream in the message codec.
pub fn frame(stream: UnixStream) -> FramedSocket {
  Framed::new(stream, LengthDelimitedCodec::new())
}

/// Connect to a preloader socket.
pub async fn connect(socket_path: &Path) -> Result<FramedSocket, ProtocolError> {
  let stream = UnixStream::connect(socket_path)
    .await
    .map_err(|e| ProtocolError::Connection(format!("{}: {e}", socket_path.display())))?;
  Ok(frame(stream))
}

/// Connect with a deadline (used for the short per-request accept timeout).
pub async fn connect_with_timeout(socket_path: &Path, timeout: Duration) -> Result<FramedSocket, ProtocolError> {
  tokio::time::timeout(timeout, connect(socket_path))
    .await
    .map_err(|_| ProtocolError::Timeout)?
}

pub async fn send_message<T: Serialize>(socket: &mut FramedSocket, message: &T) -> Result<(), ProtocolError> {
  let payload = serde_json::to_vec(message)?;
  socket.send(payload.into()).await.map_err(ProtocolError::from)
}

pub async fn recv_message<T: DeserializeOwned>(socket: &mut FramedSocket) -> Result<T, ProtocolError> {
  let frame = socket.next().await.ok_or(ProtocolError::Closed)??;
  Ok(serde_json::from_slice(&frame)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Request, Response};

  #[tokio::test]
  async fn test_roundtrip_over_socket_pair() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("test.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut framed = frame(stream);
      let request: Request = recv_message(&mut framed).await.unwrap();
      assert!(matches!(request, Request::Ping));
      send_message(&mut framed, &Response::Pong).await.unwrap();
    });

    let mut client = connect(&path).await.unwrap();
    send_message(&mut client, &Request::Ping).await.unwrap();
    let response: Response = recv_message(&mut client).await.unwrap();
    assert!(matches!(response, Response::Pong));

    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_connect_to_missing_socket_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let err = connect(&tmp.path().join("nope.sock")).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Connection(_)));
  }

  #[test]
  fn test_request_serde_shape() {
    let json = serde_json::to_value(Request::Stop).unwrap();
    assert_eq!(json["type"], "stop");
    let back: Request = serde_json::from_value(json).unwrap();
    assert!(matches!(back, Request::Stop));
  }
}
