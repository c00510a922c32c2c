//! tokio-tungstenite backed WebSocket links

use super::{LinkCommand, LinkEvent, WsConnector, WsLink, ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};
use crate::error::sanitize_error_message;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Connector for real `ws://` and `wss://` endpoints
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl WsConnector for TungsteniteConnector {
    fn open(&self, url: &str) -> WsLink {
        let (link, events, commands) = WsLink::pair();
        tokio::spawn(run_socket(url.to_string(), commands, events));
        link
    }
}

fn abnormal_close(events: &mpsc::UnboundedSender<LinkEvent>, error: impl ToString) {
    let _ = events.send(LinkEvent::Error(sanitize_error_message(&error.to_string())));
    let _ = events.send(LinkEvent::Closed {
        code: ABNORMAL_CLOSURE,
        was_clean: false,
    });
}

async fn run_socket(
    url: String,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            abnormal_close(&events, e);
            return;
        }
    };
    let _ = events.send(LinkEvent::Open);

    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        abnormal_close(&events, e);
                        return;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    debug!(target: "ws_transport", "Socket closed locally");
                    return;
                }
            },

            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(LinkEvent::Text(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(NO_STATUS_RECEIVED, |f| u16::from(f.code));
                    let _ = events.send(LinkEvent::Closed { code, was_clean: true });
                    return;
                }
                // protocol-level ping/pong frames are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    abnormal_close(&events, e);
                    return;
                }
                None => {
                    let _ = events.send(LinkEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        was_clean: false,
                    });
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_abnormal_close() {
        let mut link = TungsteniteConnector::new().open("ws://127.0.0.1:1/presence");

        let first = tokio::time::timeout(Duration::from_secs(10), link.events.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(LinkEvent::Error(_))));

        let second = link.events.recv().await;
        assert_eq!(
            second,
            Some(LinkEvent::Closed {
                code: ABNORMAL_CLOSURE,
                was_clean: false
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_url_reports_abnormal_close() {
        let mut link = TungsteniteConnector::new().open("not a url");

        assert!(matches!(link.events.recv().await, Some(LinkEvent::Error(_))));
        assert!(matches!(
            link.events.recv().await,
            Some(LinkEvent::Closed { was_clean: false, .. })
        ));
    }
}
