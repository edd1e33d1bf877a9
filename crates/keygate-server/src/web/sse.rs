// crates/keygate-server/src/web/sse.rs
// Server-sent-events stream of child notifications

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::proxy::McpProxy;
use crate::web::state::AppState;

/// Unregisters the subscriber when the client goes away. The guard lives
/// inside the stream's map closure, so its drop tracks the connection.
struct SubscriptionGuard {
    proxy: Arc<McpProxy>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.proxy.unsubscribe(self.id);
    }
}

/// `GET /mcp/sse` — notifications from the child, one SSE frame per message.
/// Without a child the stream is empty and closes immediately.
pub async fn handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (rx, guard) = match &state.proxy {
        Some(proxy) => {
            let (id, rx) = proxy.subscribe();
            (
                rx,
                Some(SubscriptionGuard {
                    proxy: proxy.clone(),
                    id,
                }),
            )
        }
        None => {
            // Sender dropped immediately: the stream ends after keep-alive.
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            (rx, None)
        }
    };

    let stream = ReceiverStream::new(rx).map(move |msg| {
        let _keep = &guard;
        Ok(Event::default().event("message").data(msg.to_string()))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
