//! # Module Locator - Découverte SSDP côté control point
//!
//! Le [`SsdpLocator`] émet des M-SEARCH, ingère les réponses et les NOTIFY,
//! maintient un cache des devices découverts borné par leur TTL
//! (`CACHE-CONTROL: max-age`) et publie des événements
//! [`SsdpDiscoveryEvent`].
//!
//! Les événements sont émis hors du verrou du cache : un handler peut
//! rappeler le locator sans interblocage. Les handlers tournent sur des
//! tâches tokio arbitraires.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SsdpLocatorOptions;
use crate::errors::SsdpError;
use crate::message::{headers, nts, SsdpMessage, SsdpMessageKind};
use crate::multicast_host_header;
use crate::transport::{ReceivedSsdpMessage, SsdpCommunicationsServer};
use url::Url;

/// Cible de recherche par défaut du timer de découverte périodique.
const DEFAULT_SEARCH_TARGET: &str = "ssdp:all";
/// MX par défaut des recherches émises sans durée d'attente.
const DEFAULT_SEARCH_MX: u64 = 3;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Clé du cache : un device est identifié par son couple (type de
/// notification, USN).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeviceKey {
    notification_type: String,
    usn: String,
}

/// Device découvert, tel que vu dans une réponse de recherche ou un NOTIFY.
#[derive(Debug, Clone)]
pub struct DiscoveredSsdpDevice {
    /// Valeur du header NT (annonce) ou ST (réponse de recherche).
    pub notification_type: String,
    /// Unique Service Name.
    pub usn: String,
    /// URL du document de description. Absente uniquement sur les entrées
    /// synthétisées pour un byebye sans alive préalable.
    pub description_location: Option<Url>,
    /// TTL annoncé. Zéro signifie immédiatement expiré.
    pub cache_lifetime: Duration,
    /// Date de réception de la dernière annonce.
    pub as_at: Instant,
    /// Headers complets du message d'origine.
    pub headers: Vec<(String, String)>,
}

impl DiscoveredSsdpDevice {
    /// Vrai si l'entrée a dépassé son TTL (ou n'en a jamais eu).
    pub fn is_expired(&self) -> bool {
        if self.cache_lifetime.is_zero() {
            return true;
        }
        // Un max-age démesuré ne doit pas faire déborder l'horloge.
        match self.as_at.checked_add(self.cache_lifetime) {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }
}

/// Événements de disponibilité publiés par le locator.
#[derive(Debug, Clone)]
pub enum SsdpDiscoveryEvent {
    /// Un device vient d'être annoncé (alive ou réponse de recherche).
    DeviceAvailable {
        device: DiscoveredSsdpDevice,
        /// Vrai si le couple (NT, USN) n'était pas encore dans le cache.
        is_newly_discovered: bool,
        /// IP de l'émetteur, quand elle est connue.
        remote_ip: Option<IpAddr>,
    },
    /// Un device a disparu (byebye ou TTL dépassé).
    DeviceUnavailable {
        device: DiscoveredSsdpDevice,
        /// Vrai si le retrait vient du balayage d'expiration, faux pour un
        /// byebye.
        expired: bool,
    },
}

/// Locator SSDP : découverte et suivi des devices du réseau.
pub struct SsdpLocator {
    comms: Arc<dyn SsdpCommunicationsServer>,
    options: SsdpLocatorOptions,
    /// Cache des devices découverts. Les événements sont toujours émis hors
    /// de ce verrou.
    cache: Mutex<HashMap<DeviceKey, DiscoveredSsdpDevice>>,
    events_tx: broadcast::Sender<SsdpDiscoveryEvent>,
    /// Tâche d'écoute des NOTIFY.
    notification_task: Mutex<Option<JoinHandle<()>>>,
    /// Tâche du timer de découverte périodique.
    broadcast_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl SsdpLocator {
    /// Crée un locator et s'abonne aux réponses de recherche entrantes.
    pub fn new(
        comms: Arc<dyn SsdpCommunicationsServer>,
        options: SsdpLocatorOptions,
    ) -> Result<Arc<Self>, SsdpError> {
        options.validate()?;

        let locator = Arc::new(Self {
            comms: comms.clone(),
            options,
            cache: Mutex::new(HashMap::new()),
            events_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            notification_task: Mutex::new(None),
            broadcast_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&locator);
        let mut responses = comms.subscribe_responses();
        let cancel = locator.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = responses.recv() => match received {
                        Ok(received) => {
                            let Some(locator) = weak.upgrade() else { break };
                            locator.process_search_response(received);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("SSDP locator lagged, {} response(s) dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(locator)
    }

    /// S'abonne aux événements de disponibilité.
    pub fn subscribe(&self) -> broadcast::Receiver<SsdpDiscoveryEvent> {
        self.events_tx.subscribe()
    }

    /// Démarre l'écoute des NOTIFY multicast. Un abonnement existant est
    /// remplacé (désabonnement puis réabonnement), ce qui rend l'appel
    /// idempotent.
    pub async fn start_listening_for_notifications(self: &Arc<Self>) -> Result<(), SsdpError> {
        self.ensure_not_disposed()?;
        self.comms.begin_listening_for_multicast().await?;

        let weak = Arc::downgrade(self);
        let mut requests = self.comms.subscribe_requests();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = requests.recv() => match received {
                        Ok(received) => {
                            let Some(locator) = weak.upgrade() else { break };
                            if received.message.kind() == SsdpMessageKind::NotifyRequest {
                                locator.process_notification(received);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("SSDP locator lagged, {} notification(s) dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let mut guard = self.notification_task.lock().unwrap();
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Arrête l'écoute des NOTIFY. L'écoute multicast du transport reste
    /// active (il peut être partagé).
    pub fn stop_listening_for_notifications(&self) {
        if let Some(handle) = self.notification_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Arme (ou ré-arme en place) le timer de découverte périodique :
    /// premier tick après `due_time`, puis un tick par `period`. Chaque tick
    /// réactive l'écoute des NOTIFY, balaye les entrées expirées puis émet
    /// une recherche `ssdp:all`.
    pub fn restart_broadcast_timer(
        self: &Arc<Self>,
        due_time: Duration,
        period: Duration,
    ) -> Result<(), SsdpError> {
        self.ensure_not_disposed()?;
        if period.is_zero() {
            return Err(SsdpError::InvalidInput(
                "broadcast period must not be zero".to_string(),
            ));
        }

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + due_time, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(locator) = weak.upgrade() else { break };
                if locator.disposed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = locator.start_listening_for_notifications().await {
                    warn!("SSDP broadcast tick could not resume listening: {}", e);
                }
                locator.remove_expired_devices();
                locator
                    .broadcast_discover_message(DEFAULT_SEARCH_TARGET, DEFAULT_SEARCH_MX)
                    .await;
            }
        });

        let mut guard = self.broadcast_task.lock().unwrap();
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Désarme le timer de découverte périodique.
    pub fn stop_broadcast_timer(&self) {
        if let Some(handle) = self.broadcast_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Émet un M-SEARCH pour `target` et, si `wait_time` est non nul,
    /// collecte pendant ce délai les devices du cache qui correspondent à la
    /// cible.
    ///
    /// `wait_time` doit valoir zéro (émission seule, sans collecte) ou plus
    /// d'une seconde : la conversion vers MX réserve une seconde de marge
    /// pour le trajet des réponses.
    pub async fn search(
        self: &Arc<Self>,
        target: &str,
        wait_time: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredSsdpDevice>, SsdpError> {
        self.ensure_not_disposed()?;

        let target = target.trim();
        if target.is_empty() {
            return Err(SsdpError::InvalidInput(
                "search target must not be empty".to_string(),
            ));
        }
        if !wait_time.is_zero() && wait_time <= Duration::from_secs(1) {
            return Err(SsdpError::InvalidInput(
                "search wait time must be zero or greater than one second".to_string(),
            ));
        }

        let mx = if wait_time < Duration::from_secs(2) {
            1
        } else {
            wait_time.as_secs() - 1
        };

        let message = self.build_discover_message(target, mx);
        if let Err(e) = self
            .comms
            .send_multicast(message.to_bytes(), 1, None, cancel)
            .await
        {
            warn!("❌ Failed to send M-SEARCH (ST={}): {}", target, e);
        } else {
            info!("📤 M-SEARCH sent (ST={}, MX={})", target, mx);
        }

        if wait_time.is_zero() {
            return Ok(Vec::new());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Search for {} cancelled", target);
                return Ok(Vec::new());
            }
            _ = self.cancel.cancelled() => return Err(SsdpError::Disposed),
            _ = time::sleep(wait_time) => {}
        }

        let cache = self.cache.lock().unwrap();
        Ok(cache
            .values()
            .filter(|device| {
                !device.is_expired() && search_target_matches(target, &device.notification_type)
            })
            .cloned()
            .collect())
    }

    /// Devices actuellement en cache, expirés compris.
    pub fn cached_devices(&self) -> Vec<DiscoveredSsdpDevice> {
        self.cache.lock().unwrap().values().cloned().collect()
    }

    /// Balaye les entrées expirées du cache et émet
    /// [`SsdpDiscoveryEvent::DeviceUnavailable`] (`expired = true`) pour
    /// chacune, groupées par USN. Appelé par le timer de découverte ;
    /// utilisable aussi directement.
    pub fn remove_expired_devices(&self) {
        // Snapshot et retrait sous verrou, émission hors verrou.
        let expired: Vec<DiscoveredSsdpDevice> = {
            let mut cache = self.cache.lock().unwrap();
            let keys: Vec<DeviceKey> = cache
                .iter()
                .filter(|(_, device)| device.is_expired())
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| cache.remove(key)).collect()
        };
        if expired.is_empty() {
            return;
        }

        let mut dead_usns: Vec<String> = Vec::new();
        for device in &expired {
            if !dead_usns.contains(&device.usn) {
                dead_usns.push(device.usn.clone());
            }
        }

        for usn in dead_usns {
            let mut group: Vec<DiscoveredSsdpDevice> = expired
                .iter()
                .filter(|device| device.usn == usn)
                .cloned()
                .collect();
            // Les entrées restantes partageant cet USN tombent avec lui.
            group.extend(self.remove_devices_by_usn(&usn));
            for device in group {
                debug!("SSDP device expired: {} ({})", device.usn, device.notification_type);
                self.emit_unavailable(device, true);
            }
        }
    }

    /// Arrêt du locator : coupe les abonnements et le timer, puis arrête le
    /// transport s'il n'est pas partagé. Idempotent.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("SSDP locator shutting down");

        self.cancel.cancel();
        self.stop_listening_for_notifications();
        self.stop_broadcast_timer();

        if !self.comms.is_shared() {
            self.comms.shutdown().await;
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), SsdpError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SsdpError::Disposed)
        } else {
            Ok(())
        }
    }

    fn build_discover_message(&self, target: &str, mx: u64) -> SsdpMessage {
        SsdpMessage::new(SsdpMessageKind::SearchRequest)
            .with_header(headers::HOST, multicast_host_header())
            .with_header(headers::USER_AGENT, self.options.user_agent())
            .with_header(headers::MAN, "\"ssdp:discover\"")
            .with_header(headers::ST, target)
            .with_header(headers::MX, mx.to_string())
    }

    /// Recherche sans collecte, pour le timer périodique.
    async fn broadcast_discover_message(&self, target: &str, mx: u64) {
        let message = self.build_discover_message(target, mx);
        if let Err(e) = self
            .comms
            .send_multicast(message.to_bytes(), 1, None, &self.cancel)
            .await
        {
            warn!("❌ Failed to broadcast M-SEARCH: {}", e);
        }
    }

    /// Ingestion d'une réponse `HTTP/1.1 200 OK`.
    fn process_search_response(&self, received: ReceivedSsdpMessage) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let message = &received.message;

        let Some(location) = message.header(headers::LOCATION) else {
            trace!(
                "Search response from {} missing LOCATION, ignored",
                received.from
            );
            return;
        };
        let Ok(location) = Url::parse(location) else {
            trace!(
                "Search response from {} with unparseable LOCATION, ignored",
                received.from
            );
            return;
        };

        let device = DiscoveredSsdpDevice {
            notification_type: message.header(headers::ST).unwrap_or_default().to_string(),
            usn: message.header(headers::USN).unwrap_or_default().to_string(),
            description_location: Some(location),
            cache_lifetime: Duration::from_secs(message.max_age().unwrap_or(0)),
            as_at: Instant::now(),
            headers: message.headers().to_vec(),
        };
        self.add_or_update_discovered_device(device, Some(received.from.ip()));
    }

    /// Ingestion d'un `NOTIFY * HTTP/1.1`, aiguillée par NTS.
    fn process_notification(&self, received: ReceivedSsdpMessage) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let message = &received.message;

        match message.header(headers::NTS).map(str::to_ascii_lowercase) {
            Some(value) if value == nts::ALIVE => self.process_alive_notification(received),
            Some(value) if value == nts::BYEBYE => self.process_byebye_notification(received),
            other => {
                trace!(
                    "NOTIFY from {} with unhandled NTS {:?}, ignored",
                    received.from,
                    other
                );
            }
        }
    }

    fn process_alive_notification(&self, received: ReceivedSsdpMessage) {
        let message = &received.message;

        let Some(location) = message.header(headers::LOCATION) else {
            trace!(
                "NOTIFY ssdp:alive from {} missing LOCATION, ignored",
                received.from
            );
            return;
        };
        let Ok(location) = Url::parse(location) else {
            trace!(
                "NOTIFY ssdp:alive from {} with unparseable LOCATION, ignored",
                received.from
            );
            return;
        };

        let device = DiscoveredSsdpDevice {
            notification_type: message.header(headers::NT).unwrap_or_default().to_string(),
            usn: message.header(headers::USN).unwrap_or_default().to_string(),
            description_location: Some(location),
            cache_lifetime: Duration::from_secs(message.max_age().unwrap_or(0)),
            as_at: Instant::now(),
            headers: message.headers().to_vec(),
        };
        self.add_or_update_discovered_device(device, Some(received.from.ip()));
    }

    fn process_byebye_notification(&self, received: ReceivedSsdpMessage) {
        let message = &received.message;

        let notification_type = match message.header(headers::NT) {
            Some(nt) if !nt.trim().is_empty() => nt.to_string(),
            _ => {
                trace!(
                    "NOTIFY ssdp:byebye from {} without NT, ignored",
                    received.from
                );
                return;
            }
        };
        let usn = message.header(headers::USN).unwrap_or_default().to_string();

        let removed = self.remove_devices_by_usn(&usn);
        if removed.is_empty() {
            // Byebye sans alive préalable : entrée minimale synthétisée pour
            // que les abonnés voient quand même la disparition.
            let device = DiscoveredSsdpDevice {
                notification_type,
                usn,
                description_location: None,
                cache_lifetime: Duration::ZERO,
                as_at: Instant::now(),
                headers: message.headers().to_vec(),
            };
            self.emit_unavailable(device, false);
        } else {
            for device in removed {
                info!("👋 SSDP device said byebye: {}", device.usn);
                self.emit_unavailable(device, false);
            }
        }
    }

    /// Insertion/remplacement dans le cache, clé (NT, USN). Les écritures
    /// plus récentes remplacent les anciennes.
    fn add_or_update_discovered_device(
        &self,
        device: DiscoveredSsdpDevice,
        remote_ip: Option<IpAddr>,
    ) {
        let key = DeviceKey {
            notification_type: device.notification_type.clone(),
            usn: device.usn.clone(),
        };
        let is_newly_discovered = {
            let mut cache = self.cache.lock().unwrap();
            let previous = cache.remove(&key);
            cache.insert(key, device.clone());
            previous.is_none()
        };

        if is_newly_discovered {
            info!(
                "✅ SSDP device discovered: {} ({})",
                device.usn, device.notification_type
            );
        }
        if self.passes_notification_filter(&device.notification_type) {
            let _ = self.events_tx.send(SsdpDiscoveryEvent::DeviceAvailable {
                device,
                is_newly_discovered,
                remote_ip,
            });
        }
    }

    /// Retire toutes les entrées du cache portant cet USN.
    fn remove_devices_by_usn(&self, usn: &str) -> Vec<DiscoveredSsdpDevice> {
        let mut cache = self.cache.lock().unwrap();
        let keys: Vec<DeviceKey> = cache
            .iter()
            .filter(|(_, device)| device.usn == usn)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| cache.remove(key)).collect()
    }

    fn emit_unavailable(&self, device: DiscoveredSsdpDevice, expired: bool) {
        if self.passes_notification_filter(&device.notification_type) {
            let _ = self
                .events_tx
                .send(SsdpDiscoveryEvent::DeviceUnavailable { device, expired });
        }
    }

    /// Le filtre laisse passer tout quand il est absent, vide ou `ssdp:all`,
    /// sinon exige l'égalité exacte avec le type de notification.
    fn passes_notification_filter(&self, notification_type: &str) -> bool {
        match self.options.notification_filter.as_deref() {
            None | Some("") => true,
            Some(DEFAULT_SEARCH_TARGET) => true,
            Some(filter) => filter == notification_type,
        }
    }
}

/// Vrai si un device de ce type de notification répond à la cible de
/// recherche donnée.
fn search_target_matches(target: &str, notification_type: &str) -> bool {
    target.eq_ignore_ascii_case(DEFAULT_SEARCH_TARGET)
        || target.eq_ignore_ascii_case(notification_type)
}

impl Drop for SsdpLocator {
    fn drop(&mut self) {
        self.cancel.cancel();
        for slot in [&self.notification_task, &self.broadcast_task] {
            if let Ok(mut guard) = slot.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }
}
