//! Transport plumbing over tokio-tungstenite.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::PusherError;

pub(crate) type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type ReadHalf = SplitStream<Transport>;
type WriteHalf = SplitSink<Transport, Message>;

/// Write side of the active transport. All outbound frames funnel through
/// `send`, serialized by the inner lock.
pub(crate) struct Connection {
    sink: Mutex<WriteHalf>,
}

impl Connection {
    pub(crate) fn new(sink: WriteHalf) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub(crate) async fn send(&self, message: Message) -> Result<(), PusherError> {
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(PusherError::from)
    }

    pub(crate) async fn close(&self) -> Result<(), PusherError> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(PusherError::from)
    }
}

/// Dial the websocket endpoint and split it into write and read halves.
pub(crate) async fn dial(url: &str) -> Result<(Connection, ReadHalf), PusherError> {
    let (ws, response) = connect_async(url).await?;
    debug!(status = %response.status(), "websocket connected");
    let (sink, stream) = ws.split();
    Ok((Connection::new(sink), stream))
}
