use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::app::AppState;
use crate::commands::dispatch;
use crate::error::ProtocolError;
use crate::resp::read_command;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state, owned by the connection's task.
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) authenticated: bool,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            authenticated: false,
        }
    }
}

pub(crate) async fn handle_connection(stream: TcpStream, app: Arc<AppState>) {
    // Disable Nagle: send responses immediately rather than waiting to coalesce small writes.
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    metrics::gauge!("snapkv_connections_active").increment(1.0);
    serve(read_half, write_half, &app).await;
    metrics::gauge!("snapkv_connections_active").decrement(1.0);
}

/// Decode, dispatch, reply, until the peer goes away or sends something
/// that is not a request frame.
pub(crate) async fn serve<R, W>(reader: R, mut writer: W, app: &AppState)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new();
    let mut reader = BufReader::new(reader);
    debug!(client = session.id, "session started");
    loop {
        let args = match read_command(&mut reader).await {
            Ok(args) => args,
            Err(ProtocolError::ConnectionClosed) => {
                debug!(client = session.id, "client disconnected");
                break;
            }
            Err(e) => {
                debug!(client = session.id, error = %e, "protocol error, closing connection");
                break;
            }
        };
        let reply = dispatch(&args, app, &mut session).await;
        if writer.write_all(&reply.to_bytes()).await.is_err() || writer.flush().await.is_err() {
            debug!(client = session.id, "write failed, closing connection");
            break;
        }
    }
}
