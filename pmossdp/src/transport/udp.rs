/*!
Binding UDP concret du serveur de communications.

Deux familles de sockets, pour la même raison que la séparation
serveur/client SSDP historique :

* Les sockets *multicast* sont liées à 0.0.0.0:1900 (une par interface
  utilisable, `SO_REUSEADDR` posé) et joignent le groupe 239.255.255.250 sur
  cette interface. Elles reçoivent NOTIFY et M-SEARCH.
* Les sockets *d'envoi* sont liées à un port éphémère de l'interface. Elles
  émettent unicast et multicast, et reçoivent les réponses HTTP/200 des
  M-SEARCH. Ne jamais les lier au port 1900 : le noyau répartirait alors les
  datagrammes entrants entre les deux familles et les réponses se perdraient
  aléatoirement.
*/

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{classify_and_dispatch, ReceivedSsdpMessage, SsdpCommunicationsServer};
use crate::errors::SsdpError;
use crate::{SSDP_MULTICAST_ADDR, SSDP_PORT};

const RECV_BUFFER_SIZE: usize = 8192;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Serveur de communications SSDP sur sockets UDP tokio.
pub struct UdpSsdpCommunicationsServer {
    shared: bool,
    request_tx: broadcast::Sender<ReceivedSsdpMessage>,
    response_tx: broadcast::Sender<ReceivedSsdpMessage>,
    /// Tâches de réception multicast, `Some` quand l'écoute est active.
    listen_tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
    /// Sockets d'envoi par interface et leurs tâches de réception, créées à
    /// la demande.
    send_state: Mutex<SendState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SendState {
    sockets: HashMap<Ipv4Addr, Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpSsdpCommunicationsServer {
    /// Crée un serveur. `shared` indique qu'il sera partagé entre plusieurs
    /// consommateurs (publisher + locator) : ceux-ci ne l'arrêteront pas.
    pub fn new(shared: bool) -> Arc<Self> {
        Arc::new(Self {
            shared,
            request_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            response_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            listen_tasks: Mutex::new(None),
            send_state: Mutex::new(SendState::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Interfaces IPv4 non-loopback de la machine.
    fn usable_interfaces() -> std::io::Result<Vec<Ipv4Addr>> {
        let mut out = Vec::new();
        for iface in get_if_addrs::get_if_addrs()? {
            if let std::net::IpAddr::V4(ipv4) = iface.ip() {
                if !ipv4.is_loopback() {
                    out.push(ipv4);
                }
            }
        }
        Ok(out)
    }

    fn multicast_group() -> Ipv4Addr {
        // La constante est une adresse IPv4 littérale valide.
        SSDP_MULTICAST_ADDR.parse().unwrap()
    }

    fn multicast_endpoint() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Self::multicast_group(), SSDP_PORT))
    }

    /// Socket liée à 0.0.0.0:1900, groupe joint sur `interface_ip`.
    fn bind_multicast_socket(interface_ip: Ipv4Addr) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr =
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&Self::multicast_group(), &interface_ip)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    /// Socket d'envoi à port éphémère sur `interface_ip`.
    fn bind_send_socket(interface_ip: Ipv4Addr) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = SocketAddr::V4(SocketAddrV4::new(interface_ip, 0));
        socket.bind(&bind_addr.into())?;
        socket.set_multicast_if_v4(&interface_ip)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    fn spawn_recv_loop(&self, socket: Arc<UdpSocket>, local_ip: Ipv4Addr) -> JoinHandle<()> {
        let request_tx = self.request_tx.clone();
        let response_tx = self.response_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((n, from)) => {
                            classify_and_dispatch(
                                &buf[..n],
                                from,
                                local_ip,
                                &request_tx,
                                &response_tx,
                            );
                        }
                        Err(e) => {
                            warn!("❌ SSDP read error on {}: {}", local_ip, e);
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Socket d'envoi de l'interface, créée (et mise en écoute des réponses)
    /// au premier usage.
    async fn send_socket_for(&self, interface_ip: Ipv4Addr) -> Result<Arc<UdpSocket>, SsdpError> {
        let mut state = self.send_state.lock().await;
        if let Some(socket) = state.sockets.get(&interface_ip) {
            return Ok(socket.clone());
        }
        let socket = Arc::new(Self::bind_send_socket(interface_ip)?);
        debug!(
            "SSDP send socket ready on {}:{}",
            interface_ip,
            socket.local_addr().map(|a| a.port()).unwrap_or(0)
        );
        let handle = self.spawn_recv_loop(socket.clone(), interface_ip);
        state.tasks.push(handle);
        state.sockets.insert(interface_ip, socket.clone());
        Ok(socket)
    }

    /// Interfaces cibles d'un envoi multicast.
    async fn multicast_targets(
        &self,
        from_local_ip: Option<Ipv4Addr>,
    ) -> Result<Vec<Ipv4Addr>, SsdpError> {
        if let Some(ip) = from_local_ip {
            return Ok(vec![ip]);
        }
        let interfaces = Self::usable_interfaces()?;
        if interfaces.is_empty() {
            // Machine sans interface réseau : on émet au moins en local.
            return Ok(vec![Ipv4Addr::LOCALHOST]);
        }
        Ok(interfaces)
    }
}

#[async_trait::async_trait]
impl SsdpCommunicationsServer for UdpSsdpCommunicationsServer {
    async fn begin_listening_for_multicast(&self) -> Result<(), SsdpError> {
        let mut state = self.listen_tasks.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let interfaces = Self::usable_interfaces()?;
        let mut tasks = Vec::new();
        for interface_ip in &interfaces {
            match Self::bind_multicast_socket(*interface_ip) {
                Ok(socket) => {
                    debug!("SSDP: joined {} on {}", SSDP_MULTICAST_ADDR, interface_ip);
                    tasks.push(self.spawn_recv_loop(Arc::new(socket), *interface_ip));
                }
                Err(e) => {
                    warn!(
                        "SSDP: failed to join {} on {}: {}",
                        SSDP_MULTICAST_ADDR, interface_ip, e
                    );
                }
            }
        }

        info!(
            "✅ SSDP multicast listening on {}:{} ({} interface(s))",
            SSDP_MULTICAST_ADDR,
            SSDP_PORT,
            tasks.len()
        );
        *state = Some(tasks);
        Ok(())
    }

    async fn stop_listening_for_multicast(&self) {
        let mut state = self.listen_tasks.lock().await;
        if let Some(tasks) = state.take() {
            for task in tasks {
                task.abort();
            }
            info!("SSDP multicast listening stopped");
        }
    }

    async fn send_unicast(
        &self,
        data: Vec<u8>,
        dest: SocketAddr,
        from_local_ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), SsdpError> {
        let socket = self.send_socket_for(from_local_ip).await?;
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Unicast send to {} cancelled", dest);
                Ok(())
            }
            result = socket.send_to(&data, dest) => {
                result?;
                Ok(())
            }
        }
    }

    async fn send_multicast(
        &self,
        data: Vec<u8>,
        send_count: usize,
        from_local_ip: Option<Ipv4Addr>,
        cancel: &CancellationToken,
    ) -> Result<(), SsdpError> {
        let dest = Self::multicast_endpoint();
        for interface_ip in self.multicast_targets(from_local_ip).await? {
            let socket = match self.send_socket_for(interface_ip).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("SSDP: no send socket on {}: {}", interface_ip, e);
                    continue;
                }
            };
            for _ in 0..send_count.max(1) {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!("Multicast send cancelled");
                        return Ok(());
                    }
                    result = socket.send_to(&data, dest) => {
                        if let Err(e) = result {
                            warn!("❌ Multicast send failed on {}: {}", interface_ip, e);
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn subscribe_requests(&self) -> broadcast::Receiver<ReceivedSsdpMessage> {
        self.request_tx.subscribe()
    }

    fn subscribe_responses(&self) -> broadcast::Receiver<ReceivedSsdpMessage> {
        self.response_tx.subscribe()
    }

    fn is_shared(&self) -> bool {
        self.shared
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.stop_listening_for_multicast().await;
        let mut state = self.send_state.lock().await;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.sockets.clear();
        info!("SSDP communications server stopped");
    }
}
