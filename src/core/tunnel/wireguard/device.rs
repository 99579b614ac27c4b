//! boringtun noise-engine wrapper.
//!
//! Owns the `Tunn` state machine and the packet buffers. All methods
//! are synchronous; the event loop drives them from one task.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use boringtun::noise::{Tunn, TunnResult};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::WireguardConfig;
use crate::core::error::TunnelError;

/// WireGuard encapsulation overhead (header + auth tag).
const WG_OVERHEAD: usize = 80;

/// Handshake initiation packets are 148 bytes; the output buffer must
/// hold at least one.
const MIN_OUT_BUF: usize = 148;

const BUF_SIZE: usize = 1500 + WG_OVERHEAD;

/// Outcome of encrypting one outbound IP packet.
pub enum Outbound<'a> {
    /// Datagram ready for the UDP socket.
    Datagram(&'a [u8]),
    /// Nothing to send; the packet was queued or dropped.
    Queued,
}

/// Outcome of decrypting one inbound datagram.
pub enum Inbound<'a> {
    /// Plaintext IP packet for the virtual stack.
    IpPacket(&'a [u8]),
    /// Control traffic (handshake response, cookie, keepalive) that
    /// must go back out over UDP; flush afterwards.
    Control(&'a [u8]),
    Done,
}

pub fn decode_key(label: &str, value: &str) -> Result<[u8; 32], TunnelError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| TunnelError::Init(format!("invalid {}: {}", label, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| TunnelError::Init(format!("{} must decode to 32 bytes", label)))
}

pub struct WgDevice {
    tunn: Box<Tunn>,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
    timer_buf: Vec<u8>,
}

impl WgDevice {
    pub fn new(config: &WireguardConfig) -> Result<Self, TunnelError> {
        let private = decode_key(
            "private_key",
            config
                .private_key
                .as_deref()
                .ok_or_else(|| TunnelError::Init("missing private_key".into()))?,
        )?;
        let peer_public = decode_key(
            "public_key",
            config
                .public_key
                .as_deref()
                .ok_or_else(|| TunnelError::Init("missing public_key".into()))?,
        )?;
        let preshared = config
            .preshared_key
            .as_deref()
            .map(|k| decode_key("preshared_key", k))
            .transpose()?;
        let keepalive = u16::try_from(config.keepalive().as_secs()).unwrap_or(u16::MAX);

        let tunn = Tunn::new(
            StaticSecret::from(private),
            PublicKey::from(peer_public),
            preshared,
            Some(keepalive),
            0,
            None,
        );

        Ok(Self {
            tunn: Box::new(tunn),
            out_buf: vec![0u8; BUF_SIZE],
            in_buf: vec![0u8; BUF_SIZE],
            timer_buf: vec![0u8; BUF_SIZE],
        })
    }

    /// Encrypt a plaintext IP packet. The returned slice borrows the
    /// internal output buffer.
    pub fn encrypt<'a>(&'a mut self, packet: &[u8]) -> Outbound<'a> {
        let needed = (packet.len() + WG_OVERHEAD).max(MIN_OUT_BUF);
        if self.out_buf.len() < needed {
            self.out_buf.resize(needed, 0);
        }
        match self.tunn.encapsulate(packet, &mut self.out_buf) {
            TunnResult::WriteToNetwork(data) => Outbound::Datagram(data),
            TunnResult::Err(e) => {
                tracing::warn!("wireguard encapsulate error: {:?}", e);
                Outbound::Queued
            }
            _ => Outbound::Queued,
        }
    }

    /// Decrypt one received datagram.
    pub fn decrypt<'a>(&'a mut self, datagram: &[u8]) -> Inbound<'a> {
        Self::classify(self.tunn.decapsulate(None, datagram, &mut self.in_buf))
    }

    /// Continue flushing queued packets after [`Inbound::Control`]; call
    /// until it returns [`Inbound::Done`].
    pub fn flush<'a>(&'a mut self) -> Inbound<'a> {
        Self::classify(self.tunn.decapsulate(None, &[], &mut self.in_buf))
    }

    fn classify(result: TunnResult<'_>) -> Inbound<'_> {
        match result {
            TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                Inbound::IpPacket(data)
            }
            TunnResult::WriteToNetwork(data) => Inbound::Control(data),
            TunnResult::Err(e) => {
                tracing::debug!("wireguard decapsulate error: {:?}", e);
                Inbound::Done
            }
            TunnResult::Done => Inbound::Done,
        }
    }

    /// Advance keepalive / rekey / retry timers. Call every ~250ms;
    /// returned packets must be sent in order.
    pub fn tick(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        loop {
            match self.tunn.update_timers(&mut self.timer_buf) {
                TunnResult::WriteToNetwork(data) => packets.push(data.to_vec()),
                TunnResult::Err(e) => {
                    tracing::debug!("wireguard timer error: {:?}", e);
                    break;
                }
                _ => break,
            }
        }
        packets
    }

    /// Produce a handshake initiation to bring the session up eagerly.
    pub fn initiate_handshake(&mut self) -> Option<Vec<u8>> {
        match self.tunn.format_handshake_initiation(&mut self.out_buf, false) {
            TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
            _ => None,
        }
    }

    /// Age of the most recent completed handshake, if any.
    pub fn time_since_last_handshake(&self) -> Option<std::time::Duration> {
        self.tunn.stats().0
    }
}
