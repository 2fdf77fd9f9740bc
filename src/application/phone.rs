//! Softphone driver
//!
//! Owns the UDP sockets and runs the dispatch loop. Datagrams, commands
//! from [`PhoneHandle`]s, timer deadlines and the audio tick are all fed
//! to the [`SipClient`] from this one task, so the protocol core never
//! needs locking.

use super::error::{PhoneError, Result};
use crate::config::PhoneConfig;
use crate::domain::client::{ClientEvent, ClientState};
use crate::infrastructure::dns::{DnsError, ServerResolver};
use crate::infrastructure::media::AudioDevices;
use crate::infrastructure::protocols::ice::{RTCP_COMPONENT, RTP_COMPONENT};
use crate::infrastructure::protocols::sip::{ClientAction, SipClient, SipError};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65535;
const CHANNEL_CAPACITY: usize = 1000;

type Reply<T> = oneshot::Sender<std::result::Result<T, SipError>>;

/// Requests accepted by the driver
#[derive(Debug)]
pub enum PhoneCommand {
    Dial { recipient: String, reply: Reply<String> },
    Accept { call_id: String, reply: Reply<()> },
    Hangup { call_id: String, reply: Reply<()> },
    Release { call_id: String, reply: Reply<()> },
    StartTone { tone: u8, reply: Reply<()> },
    StopTone { tone: u8, reply: Reply<()> },
    Disconnect,
}

/// Cloneable handle to a running [`Phone`]
#[derive(Debug, Clone)]
pub struct PhoneHandle {
    commands: mpsc::Sender<PhoneCommand>,
}

impl PhoneHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> PhoneCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| PhoneError::Stopped)?;
        Ok(rx.await.map_err(|_| PhoneError::Stopped)??)
    }

    /// Place a call; returns its Call-ID
    pub async fn dial(&self, recipient: impl Into<String>) -> Result<String> {
        let recipient = recipient.into();
        self.request(|reply| PhoneCommand::Dial { recipient, reply })
            .await
    }

    pub async fn accept(&self, call_id: &str) -> Result<()> {
        let call_id = call_id.to_string();
        self.request(|reply| PhoneCommand::Accept { call_id, reply })
            .await
    }

    pub async fn hangup(&self, call_id: &str) -> Result<()> {
        let call_id = call_id.to_string();
        self.request(|reply| PhoneCommand::Hangup { call_id, reply })
            .await
    }

    /// Drop a finished call
    pub async fn release(&self, call_id: &str) -> Result<()> {
        let call_id = call_id.to_string();
        self.request(|reply| PhoneCommand::Release { call_id, reply })
            .await
    }

    /// Start a DTMF tone on every active call
    pub async fn start_tone(&self, tone: u8) -> Result<()> {
        self.request(|reply| PhoneCommand::StartTone { tone, reply })
            .await
    }

    pub async fn stop_tone(&self, tone: u8) -> Result<()> {
        self.request(|reply| PhoneCommand::StopTone { tone, reply })
            .await
    }

    /// Hang up, unregister and stop the driver
    pub async fn disconnect(&self) -> Result<()> {
        self.commands
            .send(PhoneCommand::Disconnect)
            .await
            .map_err(|_| PhoneError::Stopped)
    }
}

enum Inbound {
    Sip {
        data: Vec<u8>,
        from: SocketAddr,
    },
    Media {
        call_id: String,
        component: u16,
        data: Vec<u8>,
    },
    Resolved {
        sip: std::result::Result<SocketAddr, DnsError>,
        stun: Option<SocketAddr>,
    },
}

/// RTP and RTCP sockets of one call
struct MediaSockets {
    sockets: Vec<(u16, Arc<UdpSocket>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaSockets {
    fn socket(&self, component: u16) -> Option<&Arc<UdpSocket>> {
        self.sockets
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, s)| s)
    }
}

impl Drop for MediaSockets {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn receive_loop<F>(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>, wrap: F)
where
    F: Fn(Vec<u8>, SocketAddr) -> Inbound + Send + 'static,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((size, from)) => {
                if tx.send(wrap(buf[..size].to_vec(), from)).await.is_err() {
                    break;
                }
            }
            // ICMP port unreachable from an earlier send
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("Failed to receive UDP datagram: {}", e);
                break;
            }
        }
    }
}

/// Local address the OS would use to reach `target`
async fn route_address(target: SocketAddr) -> io::Result<IpAddr> {
    let any: IpAddr = match target {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

pub struct Phone {
    config: PhoneConfig,
    client: SipClient,
    resolver: Arc<dyn ServerResolver>,
    sip_socket: Arc<UdpSocket>,
    /// Address media sockets bind to
    bind_ip: IpAddr,
    /// Address advertised for media sockets
    advertised_ip: IpAddr,
    media: HashMap<String, MediaSockets>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    commands: mpsc::Receiver<PhoneCommand>,
    commands_closed: bool,
    events: mpsc::Sender<ClientEvent>,
    tasks: Vec<JoinHandle<()>>,
    stopping: bool,
}

impl Phone {
    /// Bind the SIP socket; the returned receiver carries client events
    pub async fn bind(
        config: PhoneConfig,
        resolver: Arc<dyn ServerResolver>,
        devices: Arc<dyn AudioDevices>,
    ) -> Result<(Self, PhoneHandle, mpsc::Receiver<ClientEvent>)> {
        let socket = Arc::new(UdpSocket::bind(config.network.bind_address).await?);
        let local = socket.local_addr()?;
        info!("SIP socket listening on {}", local);

        let mut client = SipClient::new(&config, devices);
        client.set_local_address(local);

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (command_tx, commands) = mpsc::channel(32);
        let (events, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let task = tokio::spawn(receive_loop(socket.clone(), inbound_tx.clone(), |data, from| {
            Inbound::Sip { data, from }
        }));

        let phone = Self {
            config,
            client,
            resolver,
            sip_socket: socket,
            bind_ip: local.ip(),
            advertised_ip: local.ip(),
            media: HashMap::new(),
            inbound_tx,
            inbound_rx,
            commands,
            commands_closed: false,
            events,
            tasks: vec![task],
            stopping: false,
        };
        let handle = PhoneHandle {
            commands: command_tx,
        };
        Ok((phone, handle, event_rx))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sip_socket.local_addr()
    }

    /// Connect to the server and dispatch until disconnected
    pub async fn run(mut self) -> Result<()> {
        let tick = Duration::from_millis(self.config.media.audio_tick_ms.max(1));
        let mut audio_tick = tokio::time::interval(tick);
        audio_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.client.connect_to_server(Instant::now());
        loop {
            self.process_actions().await;
            self.flush().await;
            if self.stopping && self.client.state() == ClientState::Disconnected {
                break;
            }

            let deadline = self.client.poll_timeout();
            tokio::select! {
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound).await,
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All phone handles dropped");
                        self.commands_closed = true;
                        self.stop();
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.client.handle_timeout(Instant::now());
                }
                _ = audio_tick.tick() => self.client.pump_audio(),
            }
        }

        info!("Phone stopped");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.stopping {
            self.stopping = true;
            self.client.disconnect_from_server(Instant::now());
        }
    }

    fn handle_command(&mut self, command: PhoneCommand) {
        let now = Instant::now();
        // a dropped reply receiver only means the caller stopped waiting
        match command {
            PhoneCommand::Dial { recipient, reply } => {
                let _ = reply.send(self.client.call(&recipient));
            }
            PhoneCommand::Accept { call_id, reply } => {
                let _ = reply.send(self.client.accept(&call_id, now));
            }
            PhoneCommand::Hangup { call_id, reply } => {
                let _ = reply.send(self.client.hangup(&call_id, now));
            }
            PhoneCommand::Release { call_id, reply } => {
                let _ = reply.send(self.client.release_call(&call_id));
            }
            PhoneCommand::StartTone { tone, reply } => {
                let _ = reply.send(self.client.start_tone(tone));
            }
            PhoneCommand::StopTone { tone, reply } => {
                let _ = reply.send(self.client.stop_tone(tone));
            }
            PhoneCommand::Disconnect => self.stop(),
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let now = Instant::now();
        match inbound {
            Inbound::Sip { data, from } => self.client.handle_datagram(&data, from, now),
            Inbound::Media {
                call_id,
                component,
                data,
            } => self
                .client
                .handle_media_datagram(&call_id, component, &data, now),
            Inbound::Resolved { sip, stun } => self.servers_resolved(sip, stun).await,
        }
    }

    async fn servers_resolved(
        &mut self,
        sip: std::result::Result<SocketAddr, DnsError>,
        stun: Option<SocketAddr>,
    ) {
        if self.stopping {
            return;
        }
        let server = match sip {
            Ok(server) => server,
            Err(e) => {
                warn!("Could not lookup SIP server for {}: {}", self.config.account.domain, e);
                return;
            }
        };

        if self.bind_ip.is_unspecified() {
            match route_address(server).await {
                Ok(ip) => {
                    self.advertised_ip = ip;
                    if let Ok(local) = self.sip_socket.local_addr() {
                        self.client.set_local_address(SocketAddr::new(ip, local.port()));
                    }
                }
                Err(e) => warn!("No route to {}: {}", server, e),
            }
        }

        let now = Instant::now();
        self.client.set_sip_server(server, now);
        self.client.set_stun_server(stun, now);
    }

    fn resolve(&self, domain: String) {
        let network = &self.config.network;
        let sip_override = network.sip_server;
        let stun_override = network.stun_server;
        let use_stun = network.use_stun;
        let resolver = self.resolver.clone();
        let tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            let sip = async {
                match sip_override {
                    Some(addr) => Ok(addr),
                    None => resolver.resolve_sip(&domain).await,
                }
            };
            let stun = async {
                match stun_override {
                    Some(addr) => Some(addr),
                    None if use_stun => match resolver.resolve_stun(&domain).await {
                        Ok(addr) => Some(addr),
                        Err(e) => {
                            warn!("Could not lookup STUN server for {}: {}", domain, e);
                            None
                        }
                    },
                    None => None,
                }
            };
            let (sip, stun) = tokio::join!(sip, stun);
            let _ = tx.send(Inbound::Resolved { sip, stun }).await;
        });
    }

    async fn bind_media(&mut self, call_id: &str) {
        let mut media = MediaSockets {
            sockets: Vec::new(),
            tasks: Vec::new(),
        };
        let mut bound = Vec::new();

        for component in [RTP_COMPONENT, RTCP_COMPONENT] {
            let socket = match UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!("Could not bind media socket for call {}: {}", call_id, e);
                    let _ = self.client.hangup(call_id, Instant::now());
                    return;
                }
            };
            let port = match socket.local_addr() {
                Ok(addr) => addr.port(),
                Err(e) => {
                    warn!("Could not bind media socket for call {}: {}", call_id, e);
                    let _ = self.client.hangup(call_id, Instant::now());
                    return;
                }
            };

            let id = call_id.to_string();
            media.tasks.push(tokio::spawn(receive_loop(
                socket.clone(),
                self.inbound_tx.clone(),
                move |data, _| Inbound::Media {
                    call_id: id.clone(),
                    component,
                    data,
                },
            )));
            media.sockets.push((component, socket));
            bound.push((component, SocketAddr::new(self.advertised_ip, port)));
        }

        self.media.insert(call_id.to_string(), media);
        let now = Instant::now();
        for (component, addr) in bound {
            debug!("Call {} component {} bound to {}", call_id, component, addr);
            self.client.media_bound(call_id, component, addr, now);
        }
    }

    async fn process_actions(&mut self) {
        while let Some(action) = self.client.poll_action() {
            match action {
                ClientAction::Resolve { domain } => self.resolve(domain),
                ClientAction::BindMedia { call_id } => self.bind_media(&call_id).await,
                ClientAction::ReleaseMedia { call_id } => {
                    self.media.remove(&call_id);
                }
            }
        }
    }

    async fn flush(&mut self) {
        while let Some((dest, data)) = self.client.poll_transmit() {
            if let Err(e) = self.sip_socket.send_to(&data, dest).await {
                warn!("Failed to send to {}: {}", dest, e);
            }
        }

        while let Some((call_id, component, dest, data)) = self.client.poll_media_transmit() {
            let Some(socket) = self.media.get(&call_id).and_then(|m| m.socket(component)) else {
                continue;
            };
            if let Err(e) = socket.send_to(&data, dest).await {
                debug!("Call {} failed to send media to {}: {}", call_id, dest, e);
            }
        }

        while let Some(event) = self.client.poll_event() {
            if self.events.send(event).await.is_err() {
                debug!("Event receiver dropped");
            }
        }
    }
}

impl Drop for Phone {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
