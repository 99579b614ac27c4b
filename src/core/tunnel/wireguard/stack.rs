//! Userspace TCP/IP stack over an in-memory IP device.
//!
//! Plaintext IP packets move between this stack and the WireGuard
//! device: inbound decrypted packets are injected here, outbound
//! packets are drained, encrypted, and sent over UDP.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint};

use crate::core::error::TunnelError;

const TCP_BUF_SIZE: usize = 65536;
const EPHEMERAL_START: u16 = 49152;

/// In-memory IP device: two packet queues.
pub struct ChannelDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl ChannelDevice {
    fn new(mtu: usize) -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            mtu,
        }
    }
}

pub struct ChannelRxToken(Vec<u8>);

impl phy::RxToken for ChannelRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub struct ChannelTxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl phy::TxToken for ChannelTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.queue.push_back(buf);
        result
    }
}

impl Device for ChannelDevice {
    type RxToken<'a> = ChannelRxToken;
    type TxToken<'a> = ChannelTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: SmolInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buf = self.rx.pop_front()?;
        Some((ChannelRxToken(buf), ChannelTxToken { queue: &mut self.tx }))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(ChannelTxToken { queue: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub struct VirtualStack {
    device: ChannelDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    next_port: u16,
}

impl VirtualStack {
    pub fn new(local_ip: Ipv4Addr, prefix_len: u8, mtu: usize) -> Result<Self, TunnelError> {
        let mut device = ChannelDevice::new(mtu);
        let config = IfaceConfig::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(local_ip), prefix_len));
        });
        // Medium::Ip never resolves the gateway address, it only needs a
        // default route to exist.
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1))
            .map_err(|e| TunnelError::Init(format!("route table: {:?}", e)))?;

        Ok(Self {
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            next_port: EPHEMERAL_START,
        })
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port >= 65000 {
            EPHEMERAL_START
        } else {
            self.next_port + 1
        };
        port
    }

    /// Feed one decrypted IP packet into the stack.
    pub fn inject_packet(&mut self, packet: &[u8]) {
        self.device.rx.push_back(packet.to_vec());
    }

    /// Take the IP packets the stack wants to transmit.
    pub fn drain_tx_packets(&mut self) -> Vec<Vec<u8>> {
        self.device.tx.drain(..).collect()
    }

    /// Process queued packets against all sockets.
    pub fn poll(&mut self, now: SmolInstant) {
        let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
    }

    /// Start a TCP handshake towards `remote`. Completion is observed
    /// via [`is_tcp_connected`](Self::is_tcp_connected).
    pub fn connect_tcp(&mut self, remote: Ipv4Addr, port: u16) -> Result<SocketHandle, TunnelError> {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUF_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUF_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);
        let local_port = self.ephemeral_port();
        socket
            .connect(self.iface.context(), (IpAddress::Ipv4(remote), port), local_port)
            .map_err(|e| TunnelError::Dial {
                addr: format!("{}:{}", remote, port),
                reason: format!("{:?}", e),
            })?;
        Ok(self.sockets.add(socket))
    }

    /// One-shot UDP datagram through the tunnel; the packet leaves the
    /// device queue on the next poll/drain cycle.
    pub fn send_udp_datagram(
        &mut self,
        remote: Ipv4Addr,
        port: u16,
        payload: &[u8],
    ) -> Result<(), TunnelError> {
        let rx = udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 2], vec![0u8; 2048]);
        let tx = udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 2], vec![0u8; 2048]);
        let mut socket = udp::Socket::new(rx, tx);
        let local_port = self.ephemeral_port();
        socket.bind(local_port).map_err(|e| TunnelError::Dial {
            addr: format!("{}:{}", remote, port),
            reason: format!("bind: {:?}", e),
        })?;
        socket
            .send_slice(payload, IpEndpoint::new(IpAddress::Ipv4(remote), port))
            .map_err(|e| TunnelError::Dial {
                addr: format!("{}:{}", remote, port),
                reason: format!("send: {:?}", e),
            })?;
        let handle = self.sockets.add(socket);
        self.poll(SmolInstant::now());
        self.sockets.remove(handle);
        Ok(())
    }

    pub fn is_tcp_connected(&self, handle: SocketHandle) -> bool {
        self.sockets.get::<tcp::Socket>(handle).state() == tcp::State::Established
    }

    pub fn is_tcp_closed(&self, handle: SocketHandle) -> bool {
        matches!(
            self.sockets.get::<tcp::Socket>(handle).state(),
            tcp::State::Closed | tcp::State::TimeWait
        )
    }

    pub fn tcp_state(&self, handle: SocketHandle) -> tcp::State {
        self.sockets.get::<tcp::Socket>(handle).state()
    }

    pub fn tcp_can_recv(&self, handle: SocketHandle) -> bool {
        self.sockets.get::<tcp::Socket>(handle).can_recv()
    }

    pub fn tcp_send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize, TunnelError> {
        self.sockets
            .get_mut::<tcp::Socket>(handle)
            .send_slice(data)
            .map_err(|e| TunnelError::Dial {
                addr: String::new(),
                reason: format!("tcp send: {:?}", e),
            })
    }

    pub fn tcp_recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.sockets
            .get_mut::<tcp::Socket>(handle)
            .recv_slice(buf)
            .map_err(|e| TunnelError::Dial {
                addr: String::new(),
                reason: format!("tcp recv: {:?}", e),
            })
    }

    pub fn close_tcp(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<tcp::Socket>(handle).close();
    }

    pub fn abort_tcp(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<tcp::Socket>(handle).abort();
    }

    pub fn remove_tcp(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }
}
