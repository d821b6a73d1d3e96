//! Data channel demultiplexing and control messages
//!
//! Channel 0 carries Ethernet (L2) or IP (L3) frames for the adapter;
//! channel 1 carries structured control messages. Anything else is logged
//! and dropped. A malformed control message never disconnects the peer.
//!
//! Control message wire format:
//! [Type: 1 byte][body]
//! Routes body: [Version: 4 bytes][Count: 2 bytes] then per route:
//! [Family: 1 byte (4|6)][Address: 4|16 bytes][Prefix: 1 byte]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::admission::IpNetwork;
use crate::config::AdapterMode;
use crate::endpoint::PeerAddress;
use crate::error::{CoreError, CoreResult};
use crate::fabric::FrameSink;
use crate::{CHANNEL_FRAMES, CHANNEL_MESSAGES};

/// Control message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    /// Ask the peer for its advertised routes
    RoutesRequest = 0x01,

    /// Advertise local routes
    Routes = 0x02,
}

impl TryFrom<u8> for MessageType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::RoutesRequest),
            0x02 => Ok(Self::Routes),
            _ => Err(CoreError::MalformedMessage(format!(
                "unknown message type: 0x{value:02x}"
            ))),
        }
    }
}

/// A structured control message exchanged on channel 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Request for the peer's advertised routes
    RoutesRequest,

    /// Advertised routes with a monotonic version
    Routes {
        version: u32,
        routes: Vec<IpNetwork>,
    },
}

impl ControlMessage {
    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::RoutesRequest => {
                let mut buf = BytesMut::with_capacity(1);
                buf.put_u8(MessageType::RoutesRequest as u8);
                buf.freeze()
            }
            Self::Routes { version, routes } => {
                let mut buf = BytesMut::with_capacity(7 + routes.len() * 18);
                buf.put_u8(MessageType::Routes as u8);
                buf.put_u32(*version);
                buf.put_u16(routes.len() as u16);
                for route in routes {
                    match route.address() {
                        std::net::IpAddr::V4(v4) => {
                            buf.put_u8(4);
                            buf.put_slice(&v4.octets());
                        }
                        std::net::IpAddr::V6(v6) => {
                            buf.put_u8(6);
                            buf.put_slice(&v6.octets());
                        }
                    }
                    buf.put_u8(route.prefix_len());
                }
                buf.freeze()
            }
        }
    }

    /// Parse from wire bytes
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let mut buf = data;

        if buf.remaining() < 1 {
            return Err(CoreError::MalformedMessage("empty message".into()));
        }

        match MessageType::try_from(buf.get_u8())? {
            MessageType::RoutesRequest => {
                if buf.has_remaining() {
                    return Err(CoreError::MalformedMessage(
                        "trailing bytes after routes request".into(),
                    ));
                }
                Ok(Self::RoutesRequest)
            }
            MessageType::Routes => {
                if buf.remaining() < 6 {
                    return Err(CoreError::MalformedMessage("truncated routes header".into()));
                }
                let version = buf.get_u32();
                let count = buf.get_u16() as usize;

                let mut routes = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    if buf.remaining() < 1 {
                        return Err(CoreError::MalformedMessage("truncated route entry".into()));
                    }
                    let address = match buf.get_u8() {
                        4 => {
                            if buf.remaining() < 4 {
                                return Err(CoreError::MalformedMessage(
                                    "truncated IPv4 route".into(),
                                ));
                            }
                            let mut octets = [0u8; 4];
                            buf.copy_to_slice(&mut octets);
                            std::net::IpAddr::from(octets)
                        }
                        6 => {
                            if buf.remaining() < 16 {
                                return Err(CoreError::MalformedMessage(
                                    "truncated IPv6 route".into(),
                                ));
                            }
                            let mut octets = [0u8; 16];
                            buf.copy_to_slice(&mut octets);
                            std::net::IpAddr::from(octets)
                        }
                        other => {
                            return Err(CoreError::MalformedMessage(format!(
                                "unknown address family: {other}"
                            )))
                        }
                    };
                    if buf.remaining() < 1 {
                        return Err(CoreError::MalformedMessage("missing route prefix".into()));
                    }
                    let prefix_len = buf.get_u8();
                    routes.push(IpNetwork::new(address, prefix_len)?);
                }

                if buf.has_remaining() {
                    return Err(CoreError::MalformedMessage(
                        "trailing bytes after routes".into(),
                    ));
                }

                Ok(Self::Routes { version, routes })
            }
        }
    }
}

/// Handler for parsed control messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, from: PeerAddress, message: ControlMessage);
}

/// Routes authenticated payloads by channel number
pub struct Demultiplexer {
    mode: AdapterMode,
    ethernet_sink: Option<Arc<dyn FrameSink>>,
    ip_sink: Option<Arc<dyn FrameSink>>,
    message_handler: Option<Arc<dyn MessageHandler>>,
}

impl Demultiplexer {
    pub fn new(
        mode: AdapterMode,
        ethernet_sink: Option<Arc<dyn FrameSink>>,
        ip_sink: Option<Arc<dyn FrameSink>>,
        message_handler: Option<Arc<dyn MessageHandler>>,
    ) -> Self {
        Self {
            mode,
            ethernet_sink,
            ip_sink,
            message_handler,
        }
    }

    /// Dispatch one authenticated payload
    ///
    /// Ownership of the buffer transfers to the chosen consumer; dropped
    /// buffers go no further than this call.
    pub async fn dispatch(&self, sender: PeerAddress, channel: u8, data: Bytes) {
        match channel {
            CHANNEL_FRAMES => {
                let sink = match self.mode {
                    AdapterMode::Tap => &self.ethernet_sink,
                    AdapterMode::Tun => &self.ip_sink,
                };
                match sink {
                    Some(sink) => sink.deliver(sender, data).await,
                    None => trace!("No adapter sink, dropping frame from {}", sender),
                }
            }
            CHANNEL_MESSAGES => match ControlMessage::from_bytes(&data) {
                Ok(message) => {
                    if let Some(handler) = &self.message_handler {
                        handler.handle_message(sender, message).await;
                    }
                }
                Err(e) => {
                    warn!("Received incorrectly formatted message from {}: {}", sender, e);
                }
            },
            other => {
                warn!(
                    "Received unhandled {} byte(s) of data on channel #{}",
                    data.len(),
                    other
                );
            }
        }
    }
}
