//! # Signaling Client
//!
//! One persistent WebSocket to the signaling server. The server assigns
//! tokens, introduces peers, and relays offer/answer/ICE blobs; it never
//! sees file content.
//!
//! Two tasks per connection:
//! - a reader that parses inbound JSON into [`SignalMessage`]s and forwards
//!   them on an event channel (malformed JSON is logged and dropped),
//! - a writer that drains a bounded outbound queue into the socket.
//!
//! Once both peers are ready the signaling stream is advisory: losing it
//! does not tear down the established session, and no reconnect is
//! attempted.

pub mod wire;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

pub use wire::SignalMessage;

/// How long `register` waits for the server's `token` message.
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound queue depth; sends beyond this apply backpressure.
const OUTBOUND_QUEUE: usize = 32;

/// A derived signaling endpoint plus any token carried in the input URL.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTarget {
    /// WebSocket URL ending in `/signal`.
    pub url: Url,
    /// Peer token extracted from a `?token=` query, for prefilled connect.
    pub token: Option<String>,
}

/// Derive the signaling URL from whatever the user supplied.
///
/// Accepts `host`, `host:port`, and `http(s)://host[/path]?token=T`.
/// The query is stripped, the scheme becomes `ws`/`wss` (`wss` when none
/// was given), and `/signal` is appended unless the path already ends
/// with it.
pub fn derive_signal_url(input: &str) -> Result<SignalTarget> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidState("empty signaling server address".into()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| Error::InvalidState(format!("invalid server address: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::InvalidState(format!(
                "unsupported signaling scheme: {other}"
            )))
        }
    };

    let token = url
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned());

    url.set_query(None);
    url.set_fragment(None);
    url.set_scheme(scheme)
        .map_err(|_| Error::InvalidState("invalid signaling scheme".into()))?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/signal") {
        url.set_path(&format!("{path}/signal"));
    }

    Ok(SignalTarget { url, token })
}

/// Events surfaced by the reader task.
#[derive(Debug)]
pub enum SignalingEvent {
    /// A parsed message from the server.
    Message(SignalMessage),
    /// The stream ended; no reconnect is attempted.
    Closed,
}

/// Handle to an open, registered signaling connection.
///
/// Dropping the client closes the outbound queue; the writer task sends a
/// close frame and exits.
#[derive(Debug, Clone)]
pub struct SignalingClient {
    outbound: mpsc::Sender<SignalMessage>,
}

impl SignalingClient {
    /// Open the stream and wait for the server to assign a token.
    ///
    /// Returns the client, the assigned token, and the receiver for
    /// everything else the server sends.
    pub async fn register(
        target: &SignalTarget,
    ) -> Result<(Self, String, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let (socket, _response) = connect_async(target.url.as_str())
            .await
            .map_err(|e| Error::SignalingUnreachable(e.to_string()))?;
        debug!(url = %target.url, "signaling stream open");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalMessage>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (token_tx, token_rx) = oneshot::channel::<String>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!(error = %e, "signaling write failed");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let mut token_tx = Some(token_tx);
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(SignalMessage::Token { token }) => {
                            if let Some(tx) = token_tx.take() {
                                let _ = tx.send(token);
                            } else {
                                // Token reassignment after registration is
                                // not part of the protocol.
                                warn!("unexpected extra token message");
                            }
                        }
                        Ok(msg) => {
                            if event_tx.send(SignalingEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "dropping malformed signaling message");
                        }
                    },
                    Ok(Message::Binary(_)) => {
                        debug!("dropping binary signaling frame");
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "signaling read failed");
                        break;
                    }
                }
            }
            let _ = event_tx.send(SignalingEvent::Closed);
        });

        let token = match tokio::time::timeout(TOKEN_TIMEOUT, token_rx).await {
            Ok(Ok(token)) => token,
            Ok(Err(_)) => return Err(Error::SignalingClosed),
            Err(_) => return Err(Error::TokenTimeout),
        };

        Ok((Self { outbound: outbound_tx }, token, event_rx))
    }

    async fn send(&self, msg: SignalMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::SignalingClosed)
    }

    /// Ask the server to introduce us to `peer`.
    pub async fn send_connect(&self, peer: &str) -> Result<()> {
        self.send(SignalMessage::Connect { peer_token: peer.into() }).await
    }

    /// Accept an introduction from `peer`.
    pub async fn send_accept(&self, peer: &str) -> Result<()> {
        self.send(SignalMessage::Accept { peer_token: peer.into() }).await
    }

    /// Relay our SDP offer to `peer`.
    pub async fn send_offer(&self, peer: &str, sdp: String) -> Result<()> {
        self.send(SignalMessage::Offer { peer_token: peer.into(), sdp }).await
    }

    /// Relay our SDP answer to `peer`.
    pub async fn send_answer(&self, peer: &str, sdp: String) -> Result<()> {
        self.send(SignalMessage::Answer { peer_token: peer.into(), sdp }).await
    }

    /// Relay one local ICE candidate to `peer`.
    pub async fn send_ice(&self, peer: &str, ice: String) -> Result<()> {
        self.send(SignalMessage::Ice { peer_token: peer.into(), ice }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived(input: &str) -> SignalTarget {
        derive_signal_url(input).unwrap()
    }

    #[test]
    fn test_bare_host_defaults_to_wss() {
        let target = derived("example.com");
        assert_eq!(target.url.as_str(), "wss://example.com/signal");
        assert_eq!(target.token, None);
    }

    #[test]
    fn test_host_with_port() {
        let target = derived("example.com:8443");
        assert_eq!(target.url.as_str(), "wss://example.com:8443/signal");
    }

    #[test]
    fn test_http_maps_to_ws() {
        let target = derived("http://example.com");
        assert_eq!(target.url.as_str(), "ws://example.com/signal");
    }

    #[test]
    fn test_https_maps_to_wss_and_keeps_path() {
        let target = derived("https://example.com/app");
        assert_eq!(target.url.as_str(), "wss://example.com/app/signal");
    }

    #[test]
    fn test_existing_signal_path_is_not_doubled() {
        let target = derived("https://example.com/signal");
        assert_eq!(target.url.as_str(), "wss://example.com/signal");
    }

    #[test]
    fn test_trailing_slash_is_normalized() {
        let target = derived("http://example.com/");
        assert_eq!(target.url.as_str(), "ws://example.com/signal");
    }

    #[test]
    fn test_token_query_is_extracted_and_stripped() {
        let target = derived("https://example.com/?token=ab12");
        assert_eq!(target.url.as_str(), "wss://example.com/signal");
        assert_eq!(target.token.as_deref(), Some("ab12"));
    }

    #[test]
    fn test_ws_scheme_is_preserved() {
        let target = derived("ws://localhost:9090");
        assert_eq!(target.url.as_str(), "ws://localhost:9090/signal");
    }

    #[test]
    fn test_empty_input_is_rejected() {
        assert!(derive_signal_url("   ").is_err());
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        assert!(derive_signal_url("ftp://example.com").is_err());
    }
}
