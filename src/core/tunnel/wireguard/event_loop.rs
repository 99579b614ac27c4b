//! Event loop pumping packets between the UDP socket, the boringtun
//! device, and the virtual TCP/IP stack.
//!
//! Runs as one background task per live tunnel. Probe-facing calls
//! (connect, one-shot UDP) are submitted over a command channel.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use smoltcp::time::Instant as SmolInstant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::WireguardConfig;
use crate::core::error::TunnelError;

use super::device::{Inbound, Outbound, WgDevice};
use super::stack::VirtualStack;
use super::stream::{StreamChannels, StreamMessage, VirtualStream};

/// boringtun wants its timers ticked about every 250ms.
const TIMER_TICK: Duration = Duration::from_millis(250);

const MAX_STREAMS: usize = 256;
const COMMAND_DEPTH: usize = 64;
const UDP_BUF_SIZE: usize = 65536;
const RECV_BUF_SIZE: usize = 8192;
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_MTU: usize = 1420;

enum Command {
    Connect {
        remote: Ipv4Addr,
        port: u16,
        reply: oneshot::Sender<Result<VirtualStream, TunnelError>>,
    },
    SendUdp {
        remote: Ipv4Addr,
        port: u16,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },
}

struct PendingConnect {
    handle: SocketHandle,
    reply: oneshot::Sender<Result<VirtualStream, TunnelError>>,
    stream: VirtualStream,
    channels: StreamChannels,
    deadline: tokio::time::Instant,
}

/// Handle to a running event loop.
pub struct WgEventLoop {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl WgEventLoop {
    /// Bind the UDP socket, fire the first handshake, and spawn the
    /// pump task. `handshake_clock` receives the unix-seconds timestamp
    /// of the most recent completed handshake (0 while none happened).
    pub async fn start(
        config: &WireguardConfig,
        local_ip: Ipv4Addr,
        prefix_len: u8,
        peer: SocketAddr,
        handshake_clock: Arc<AtomicU64>,
    ) -> Result<Self, TunnelError> {
        let mut device = WgDevice::new(config)?;
        let stack = VirtualStack::new(local_ip, prefix_len, DEFAULT_MTU)?;

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        tracing::info!(
            local = %udp.local_addr()?,
            peer = %peer,
            "wireguard udp socket bound"
        );

        if let Some(init) = device.initiate_handshake() {
            udp.send_to(&init, peer).await?;
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_DEPTH);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let mut inner = Pump {
                udp,
                device,
                stack,
                peer,
                streams: HashMap::new(),
                pending: Vec::new(),
                commands: command_rx,
                handshake_clock,
            };
            inner.run(task_cancel).await;
        });

        Ok(Self {
            commands: command_tx,
            cancel,
            task,
        })
    }

    pub async fn connect(
        &self,
        remote: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<VirtualStream, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { remote, port, reply })
            .await
            .map_err(|_| TunnelError::NotConnected)?;
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| TunnelError::Dial {
                addr: format!("{}:{}", remote, port),
                reason: "virtual connect timed out".to_string(),
            })?
            .map_err(|_| TunnelError::NotConnected)?
    }

    pub async fn send_udp(
        &self,
        remote: Ipv4Addr,
        port: u16,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendUdp {
                remote,
                port,
                payload,
                reply,
            })
            .await
            .map_err(|_| TunnelError::NotConnected)?;
        rx.await.map_err(|_| TunnelError::NotConnected)?
    }

    /// Stop the pump task and drop the UDP socket.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

struct Pump {
    udp: UdpSocket,
    device: WgDevice,
    stack: VirtualStack,
    peer: SocketAddr,
    streams: HashMap<SocketHandle, StreamChannels>,
    pending: Vec<PendingConnect>,
    commands: mpsc::Receiver<Command>,
    handshake_clock: Arc<AtomicU64>,
}

impl Pump {
    async fn run(&mut self, cancel: CancellationToken) {
        let mut udp_buf = vec![0u8; UDP_BUF_SIZE];
        let mut recv_buf = [0u8; RECV_BUF_SIZE];
        let mut timer = time::interval(TIMER_TICK);
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            self.pump_stream_writes();

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("wireguard event loop stopping");
                    return;
                }
                result = self.udp.recv_from(&mut udp_buf) => {
                    match result {
                        Ok((n, _)) => self.on_datagram(&udp_buf[..n]).await,
                        Err(e) => tracing::warn!("wireguard udp recv error: {}", e),
                    }
                }
                _ = timer.tick() => {
                    for packet in self.device.tick() {
                        self.send_peer(&packet).await;
                    }
                    self.update_handshake_clock();
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command);
                }
            }

            self.pump_packets(&mut recv_buf).await;
            self.settle_pending();
            self.reap_closed();
        }
    }

    fn update_handshake_clock(&self) {
        if let Some(age) = self.device.time_since_last_handshake() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            self.handshake_clock
                .store(now.saturating_sub(age.as_secs()), Ordering::Relaxed);
        }
    }

    async fn on_datagram(&mut self, data: &[u8]) {
        enum Action {
            Inject,
            Send(Vec<u8>),
            None,
        }
        let action = match self.device.decrypt(data) {
            Inbound::IpPacket(pkt) => {
                self.stack.inject_packet(pkt);
                Action::Inject
            }
            Inbound::Control(pkt) => Action::Send(pkt.to_vec()),
            Inbound::Done => Action::None,
        };
        if let Action::Send(pkt) = action {
            self.send_peer(&pkt).await;
            // A handshake response may have queued data behind it.
            loop {
                enum Flushed {
                    Send(Vec<u8>),
                    Continue,
                    Stop,
                }
                let next = match self.device.flush() {
                    Inbound::IpPacket(pkt) => {
                        self.stack.inject_packet(pkt);
                        Flushed::Continue
                    }
                    Inbound::Control(pkt) => Flushed::Send(pkt.to_vec()),
                    Inbound::Done => Flushed::Stop,
                };
                match next {
                    Flushed::Send(pkt) => self.send_peer(&pkt).await,
                    Flushed::Continue => {}
                    Flushed::Stop => break,
                }
            }
            self.update_handshake_clock();
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { remote, port, reply } => {
                if self.streams.len() >= MAX_STREAMS {
                    let _ = reply.send(Err(TunnelError::Dial {
                        addr: format!("{}:{}", remote, port),
                        reason: format!("stream limit ({}) reached", MAX_STREAMS),
                    }));
                    return;
                }
                match self.stack.connect_tcp(remote, port) {
                    Ok(handle) => {
                        let (stream, channels) = VirtualStream::new_pair();
                        self.pending.push(PendingConnect {
                            handle,
                            reply,
                            stream,
                            channels,
                            deadline: tokio::time::Instant::now() + CONNECT_DEADLINE,
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::SendUdp {
                remote,
                port,
                payload,
                reply,
            } => {
                let _ = reply.send(self.stack.send_udp_datagram(remote, port, &payload));
            }
        }
    }

    /// Move data written by stream holders into the smoltcp sockets.
    fn pump_stream_writes(&mut self) {
        let handles: Vec<SocketHandle> = self.streams.keys().copied().collect();
        for handle in handles {
            let Some(channels) = self.streams.get_mut(&handle) else {
                continue;
            };
            loop {
                match channels.outbound_rx.try_recv() {
                    Ok(StreamMessage::Data(data)) => {
                        if let Err(e) = self.stack.tcp_send(handle, &data) {
                            tracing::trace!("virtual tcp send failed: {}", e);
                        }
                    }
                    Ok(StreamMessage::Close) => {
                        self.stack.close_tcp(handle);
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.stack.close_tcp(handle);
                        break;
                    }
                }
            }
        }
    }

    /// Poll the stack, encrypt its outbound packets, and deliver
    /// inbound socket data to the streams.
    async fn pump_packets(&mut self, recv_buf: &mut [u8]) {
        self.stack.poll(SmolInstant::now());

        for ip_packet in self.stack.drain_tx_packets() {
            let datagram = match self.device.encrypt(&ip_packet) {
                Outbound::Datagram(d) => d.to_vec(),
                Outbound::Queued => continue,
            };
            self.send_peer(&datagram).await;
        }

        let handles: Vec<SocketHandle> = self.streams.keys().copied().collect();
        for handle in handles {
            while self.stack.tcp_can_recv(handle) {
                match self.stack.tcp_recv(handle, recv_buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(channels) = self.streams.get(&handle) {
                            let chunk = Bytes::copy_from_slice(&recv_buf[..n]);
                            if channels.inbound_tx.try_send(chunk).is_err() {
                                tracing::warn!("virtual stream inbound channel full, dropping");
                                break;
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    /// Resolve pending connects whose handshake finished, failed, or
    /// timed out.
    fn settle_pending(&mut self) {
        let now = tokio::time::Instant::now();
        let mut index = 0;
        while index < self.pending.len() {
            let connected = self.stack.is_tcp_connected(self.pending[index].handle);
            let dead = self.stack.is_tcp_closed(self.pending[index].handle)
                || now >= self.pending[index].deadline;
            if !connected && !dead {
                index += 1;
                continue;
            }
            let pending = self.pending.swap_remove(index);
            if connected {
                self.streams.insert(pending.handle, pending.channels);
                let _ = pending.reply.send(Ok(pending.stream));
            } else {
                let state = self.stack.tcp_state(pending.handle);
                self.stack.abort_tcp(pending.handle);
                self.stack.remove_tcp(pending.handle);
                let _ = pending.reply.send(Err(TunnelError::Dial {
                    addr: String::new(),
                    reason: format!("virtual tcp connect failed (state {:?})", state),
                }));
            }
        }
    }

    /// Tear down streams whose sockets closed.
    fn reap_closed(&mut self) {
        let closed: Vec<SocketHandle> = self
            .streams
            .keys()
            .filter(|h| self.stack.is_tcp_closed(**h))
            .copied()
            .collect();
        for handle in closed {
            if let Some(channels) = self.streams.remove(&handle) {
                // Empty chunk signals EOF to the stream holder.
                let _ = channels.inbound_tx.try_send(Bytes::new());
            }
            self.stack.remove_tcp(handle);
        }
    }

    async fn send_peer(&self, data: &[u8]) {
        if let Err(e) = self.udp.send_to(data, self.peer).await {
            tracing::warn!("wireguard udp send error: {}", e);
        }
    }
}
