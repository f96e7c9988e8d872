//! Connection after a completed disguise handshake.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use crate::disguise::tls::{self, ContentType, MAX_FRAGMENT_LEN};
use crate::disguise::Transport;
use crate::error::Result;

/// A stream ready for session traffic, framed by its disguise.
///
/// TLS connections carry data in ApplicationData records; WebSocket
/// connections in binary frames. A *unit* is one such record or frame.
pub enum PreparedConn<S> {
    Tls(S),
    WebSocket(WebSocketStream<S>),
}

impl<S> PreparedConn<S> {
    /// The disguise this connection runs under.
    pub fn transport(&self) -> Transport {
        match self {
            PreparedConn::Tls(_) => Transport::Tls,
            PreparedConn::WebSocket(_) => Transport::WebSocket,
        }
    }
}

impl<S> PreparedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next unit of payload; `None` once the peer has closed.
    pub async fn read_unit(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            PreparedConn::Tls(stream) => loop {
                match tls::read_record(stream).await? {
                    Some((t, payload)) if t == ContentType::ApplicationData as u8 => {
                        return Ok(Some(payload))
                    }
                    Some((t, _)) if t == ContentType::Alert as u8 => return Ok(None),
                    Some(_) => continue,
                    None => return Ok(None),
                }
            },
            PreparedConn::WebSocket(ws) => loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }

    /// Send `data`, split into as many units as needed.
    pub async fn write_unit(&mut self, data: &[u8]) -> Result<()> {
        match self {
            PreparedConn::Tls(stream) => {
                for chunk in data.chunks(MAX_FRAGMENT_LEN) {
                    tls::write_record(stream, ContentType::ApplicationData, chunk).await?;
                }
                Ok(())
            }
            PreparedConn::WebSocket(ws) => {
                ws.send(Message::Binary(data.to_vec())).await?;
                Ok(())
            }
        }
    }

    /// Close the connection, flushing what the disguise needs.
    pub async fn close(self) -> Result<()> {
        match self {
            PreparedConn::Tls(mut stream) => {
                stream.shutdown().await?;
                Ok(())
            }
            PreparedConn::WebSocket(mut ws) => {
                ws.close(None).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tls_units_are_chunked() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = PreparedConn::Tls(a);
        let mut rx = PreparedConn::Tls(b);

        let data = vec![0xabu8; MAX_FRAGMENT_LEN + 100];
        tx.write_unit(&data).await.unwrap();
        tx.close().await.unwrap();

        let first = rx.read_unit().await.unwrap().unwrap();
        let second = rx.read_unit().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_FRAGMENT_LEN);
        assert_eq!(second.len(), 100);
        assert!(rx.read_unit().await.unwrap().is_none());
        assert_eq!(rx.transport(), Transport::Tls);
    }
}
