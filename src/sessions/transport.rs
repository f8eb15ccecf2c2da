//! Client transports: browser WebSockets and native SSH channels.
//!
//! Outgoing traffic goes through a [`ClientSink`], a cloneable handle onto a
//! per-client writer task, so the control loop, monitors and error paths
//! can all write without sharing the socket. Incoming traffic is read from a
//! [`ClientSource`] and decoded into [`Inbound`] messages.
//!
//! Web text frames carry a one-byte tag:
//!
//! | Tag | Payload          | Meaning        |
//! |-----|------------------|----------------|
//! | `1` | bytes            | terminal input |
//! | `9` | anything         | ping           |
//! | `w` | `WIDTH,HEIGHT`   | resize         |
//!
//! Guacamole sessions send untagged raw instructions.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tracing::debug;

use super::channels::WindowSize;

const SINK_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    KeepAlive,
    Close(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    Resize(WindowSize),
    Ping,
    /// An untagged frame, passed through verbatim.
    Raw(String),
}

impl Inbound {
    /// Whether this message counts as user activity for the idle timer.
    pub fn is_activity(&self) -> bool {
        match self {
            Self::Data(_) | Self::Resize(_) => true,
            Self::Ping => false,
            Self::Raw(raw) => !is_guacd_heartbeat(raw),
        }
    }
}

fn is_guacd_heartbeat(raw: &str) -> bool {
    raw.split_once('.')
        .map(|(_, rest)| rest.split([',', ';']).next().unwrap_or(""))
        .is_some_and(|op| op == "nop" || op == "sync")
}

/// Decode a tagged web text frame.
pub fn parse_frame(text: &str) -> Option<Inbound> {
    let mut chars = text.chars();
    let tag = chars.next()?;
    let rest = chars.as_str();
    match tag {
        '1' => Some(Inbound::Data(rest.as_bytes().to_vec())),
        '9' => Some(Inbound::Ping),
        'w' => {
            let (w, h) = rest.split_once(',')?;
            Some(Inbound::Resize(WindowSize::clamped(
                w.trim().parse().ok()?,
                h.trim().parse().ok()?,
            )))
        }
        _ => None,
    }
}

/// Cloneable write handle onto one client.
#[derive(Clone)]
pub struct ClientSink {
    tx: mpsc::Sender<Outbound>,
}

impl ClientSink {
    /// Sink backed by an in-memory channel.
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn web(mut ws: SplitSink<WebSocket, Message>) -> Self {
        let (sink, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let frame = match msg {
                    Outbound::Text(text) => Message::Text(text.into()),
                    Outbound::KeepAlive => Message::Text(String::new().into()),
                    Outbound::Close(reason) => {
                        let _ = ws
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: reason.unwrap_or_default().into(),
                            })))
                            .await;
                        break;
                    }
                };
                if ws.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws.close().await;
        });
        sink
    }

    pub fn native(handle: Handle, channel: ChannelId) -> Self {
        let (sink, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Outbound::Text(text) => {
                        if handle
                            .data(channel, CryptoVec::from_slice(text.as_bytes()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Outbound::KeepAlive => {}
                    Outbound::Close(reason) => {
                        if let Some(reason) = reason {
                            let _ = handle
                                .data(channel, CryptoVec::from_slice(reason.as_bytes()))
                                .await;
                        }
                        break;
                    }
                }
            }
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            debug!("Native channel {channel:?} closed");
        });
        sink
    }

    /// Returns false once the client is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Outbound::Text(text.into())).await.is_ok()
    }

    /// Queue without waiting. False when the client is gone or its queue is
    /// full.
    pub fn try_send_text(&self, text: impl Into<String>) -> bool {
        self.tx.try_send(Outbound::Text(text.into())).is_ok()
    }

    pub async fn keepalive(&self) -> bool {
        self.tx.send(Outbound::KeepAlive).await.is_ok()
    }

    pub async fn close(&self, reason: Option<String>) {
        let _ = self.tx.send(Outbound::Close(reason)).await;
    }

    pub fn try_close(&self) {
        let _ = self.tx.try_send(Outbound::Close(None));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side of a client connection.
pub enum ClientSource {
    Web(SplitStream<WebSocket>),
    Channel(mpsc::Receiver<Inbound>),
}

impl ClientSource {
    /// Next decoded message, or `None` once the client disconnects. With
    /// `raw` set, web frames are passed through untagged.
    pub async fn next(&mut self, raw: bool) -> Option<Inbound> {
        match self {
            Self::Web(ws) => loop {
                match ws.next().await? {
                    Ok(Message::Text(text)) => {
                        if raw {
                            return Some(Inbound::Raw(text.to_string()));
                        }
                        if let Some(msg) = parse_frame(&text) {
                            return Some(msg);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => {}
                }
            },
            Self::Channel(rx) => rx.recv().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::channels::{MAX_COLS, MAX_ROWS};

    #[test]
    fn test_parse_frame_tags() {
        assert_eq!(parse_frame("1ls\r"), Some(Inbound::Data(b"ls\r".to_vec())));
        assert_eq!(parse_frame("9"), Some(Inbound::Ping));
        assert_eq!(
            parse_frame("w120,40"),
            Some(Inbound::Resize(WindowSize {
                width: 120,
                height: 40
            }))
        );
        assert_eq!(parse_frame("w120"), None);
        assert_eq!(
            parse_frame("w65535,65535"),
            Some(Inbound::Resize(WindowSize {
                width: MAX_COLS,
                height: MAX_ROWS
            }))
        );
        assert_eq!(parse_frame("w-1,40"), None);
        assert_eq!(parse_frame(""), None);
        assert_eq!(parse_frame("x"), None);
    }

    #[test]
    fn test_activity() {
        assert!(Inbound::Data(vec![]).is_activity());
        assert!(!Inbound::Ping.is_activity());
        assert!(!Inbound::Raw("3.nop;".into()).is_activity());
        assert!(!Inbound::Raw("4.sync,8.12345678;".into()).is_activity());
        assert!(Inbound::Raw("3.key,5.65307,1.1;".into()).is_activity());
    }

    #[tokio::test]
    async fn test_channel_sink_and_source() {
        let (sink, mut rx) = ClientSink::channel();
        assert!(sink.send_text("hi").await);
        assert!(sink.keepalive().await);
        sink.close(Some("bye".into())).await;
        assert_eq!(rx.recv().await, Some(Outbound::Text("hi".into())));
        assert_eq!(rx.recv().await, Some(Outbound::KeepAlive));
        assert_eq!(rx.recv().await, Some(Outbound::Close(Some("bye".into()))));
        drop(rx);
        assert!(!sink.send_text("late").await);

        let (sink, mut rx) = ClientSink::channel();
        let mut queued = 0;
        while sink.try_send_text("x") {
            queued += 1;
        }
        assert_eq!(queued, SINK_CAPACITY);
        rx.recv().await.unwrap();
        assert!(sink.try_send_text("y"));

        let (tx, rx) = mpsc::channel(1);
        let mut source = ClientSource::Channel(rx);
        tx.send(Inbound::Ping).await.unwrap();
        drop(tx);
        assert_eq!(source.next(false).await, Some(Inbound::Ping));
        assert_eq!(source.next(false).await, None);
    }
}
