//! # Module Publisher - Annonces SSDP côté device
//!
//! Le [`SsdpPublisher`] tient le registre des devices racine annoncés,
//! émet les NOTIFY `ssdp:alive` (à l'ajout, périodiquement, et à la
//! demande), répond aux M-SEARCH en unicast après un délai aléatoire borné
//! par MX, et émet les NOTIFY `ssdp:byebye` au retrait d'un device et à
//! l'arrêt.
//!
//! Cycle de vie : construit → actif → arrêté, sans retour en arrière. Toute
//! opération non-observationnelle après l'arrêt échoue ; les datagrammes
//! entrants après l'arrêt sont silencieusement ignorés.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SsdpPublisherOptions;
use crate::device::{
    flatten_tree, notification_pairs, search_response_pairs, SsdpRootDevice,
};
use crate::errors::SsdpError;
use crate::message::{headers, nts, SsdpMessage, SsdpMessageKind};
use crate::multicast_host_header;
use crate::transport::{ReceivedSsdpMessage, SsdpCommunicationsServer};

/// Fenêtre de suppression des M-SEARCH dupliqués.
const SEARCH_DEDUP_WINDOW: Duration = Duration::from_millis(500);
/// Taille au-delà de laquelle la table de dédup est balayée.
const SEARCH_DEDUP_SWEEP_THRESHOLD: usize = 10;
/// Délai minimal avant une réponse M-SEARCH, en millisecondes.
const MIN_RESPONSE_DELAY_MS: u64 = 16;
/// Valeur MX maximale admise, en secondes.
const MAX_MX_SECONDS: i64 = 120;
/// Premier tick du heartbeat alive après son armement.
const HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_secs(5);
/// Nombre d'émissions d'un byebye au retrait d'un device.
const BYEBYE_SEND_COUNT_REMOVE: usize = 3;
/// Nombre d'émissions d'un byebye à l'arrêt du publisher.
const BYEBYE_SEND_COUNT_SHUTDOWN: usize = 1;

/// Publisher SSDP : annonce un ensemble d'arbres de devices UPnP.
pub struct SsdpPublisher {
    comms: Arc<dyn SsdpCommunicationsServer>,
    options: SsdpPublisherOptions,
    /// Registre des racines annoncées. Jamais tenu pendant une émission.
    devices: Mutex<Vec<Arc<SsdpRootDevice>>>,
    /// M-SEARCH récents, clé `ST:endpoint` → date de réception.
    recent_searches: Mutex<HashMap<String, Instant>>,
    /// Tâche du heartbeat alive.
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    rng: Mutex<StdRng>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl SsdpPublisher {
    /// Crée un publisher, démarre l'écoute multicast, s'abonne aux requêtes
    /// entrantes et émet une première passe d'annonces alive.
    pub async fn new(
        comms: Arc<dyn SsdpCommunicationsServer>,
        options: SsdpPublisherOptions,
    ) -> Result<Arc<Self>, SsdpError> {
        options.validate()?;
        comms.begin_listening_for_multicast().await?;

        let publisher = Arc::new(Self {
            comms: comms.clone(),
            options,
            devices: Mutex::new(Vec::new()),
            recent_searches: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            rng: Mutex::new(StdRng::from_entropy()),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&publisher);
        let mut requests = comms.subscribe_requests();
        let cancel = publisher.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = requests.recv() => match received {
                        Ok(received) => {
                            let Some(publisher) = weak.upgrade() else { break };
                            publisher.handle_request(received);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("SSDP publisher lagged, {} request(s) dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        publisher.send_all_alive_notifications().await;
        info!("✅ SSDP publisher started");
        Ok(publisher)
    }

    /// Ajoute un device racine au registre. Idempotent par UDN ; un ajout
    /// effectif déclenche immédiatement une passe d'annonces alive pour ce
    /// device.
    pub async fn add_device(&self, device: Arc<SsdpRootDevice>) -> Result<(), SsdpError> {
        self.ensure_not_disposed()?;

        let added = {
            let mut devices = self.devices.lock().unwrap();
            let udn = device.properties().udn();
            if devices.iter().any(|d| d.properties().udn() == udn) {
                false
            } else {
                devices.push(device.clone());
                true
            }
        };

        if added {
            info!("✅ SSDP device added: {}", device.properties().udn());
            self.send_alive_notifications_for(&device).await;
        }
        Ok(())
    }

    /// Retire un device racine du registre. Idempotent ; un retrait effectif
    /// émet d'abord la passe byebye (3 émissions), puis oublie le device.
    pub async fn remove_device(&self, device: &Arc<SsdpRootDevice>) -> Result<(), SsdpError> {
        self.ensure_not_disposed()?;

        let removed = {
            let mut devices = self.devices.lock().unwrap();
            let udn = device.properties().udn();
            match devices.iter().position(|d| d.properties().udn() == udn) {
                Some(pos) => Some(devices.remove(pos)),
                None => None,
            }
        };

        if let Some(device) = removed {
            self.send_byebye_notifications_for(&device, BYEBYE_SEND_COUNT_REMOVE, &self.cancel)
                .await;
            info!("👋 SSDP device removed: {}", device.properties().udn());
        }
        Ok(())
    }

    /// Devices actuellement annoncés.
    pub fn devices(&self) -> Vec<Arc<SsdpRootDevice>> {
        self.devices.lock().unwrap().clone()
    }

    /// Arme le heartbeat alive : premier tick 5 secondes après l'appel, puis
    /// un tick par `interval`. Un heartbeat déjà armé est remplacé.
    pub fn start_sending_alive_notifications(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<(), SsdpError> {
        self.ensure_not_disposed()?;
        if interval.is_zero() {
            return Err(SsdpError::InvalidInput(
                "alive notification interval must not be zero".to_string(),
            ));
        }

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + HEARTBEAT_INITIAL_DELAY, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(publisher) = weak.upgrade() else { break };
                // Les ticks pendant l'arrêt sont abandonnés.
                if publisher.disposed.load(Ordering::SeqCst) {
                    break;
                }
                publisher.send_all_alive_notifications().await;
            }
        });

        let mut guard = self.heartbeat.lock().unwrap();
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Désarme le heartbeat alive. Sans effet s'il n'est pas armé.
    pub fn stop_sending_alive_notifications(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Arrêt du publisher : désarme le heartbeat, se désabonne des requêtes,
    /// émet un byebye (1 émission) pour chaque device annoncé, puis arrête
    /// le transport s'il n'est pas partagé. Idempotent.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("SSDP publisher shutting down, sending byebye for all devices");

        self.stop_sending_alive_notifications();
        self.cancel.cancel();

        // Les émissions d'arrêt utilisent un jeton propre : le jeton du
        // publisher vient d'être annulé pour couper les handlers.
        let shutdown_cancel = CancellationToken::new();
        let devices = { self.devices.lock().unwrap().clone() };
        for device in devices {
            self.send_byebye_notifications_for(
                &device,
                BYEBYE_SEND_COUNT_SHUTDOWN,
                &shutdown_cancel,
            )
            .await;
        }

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

    /// Point d'entrée des requêtes entrantes.
    fn handle_request(self: &Arc<Self>, received: ReceivedSsdpMessage) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if received.message.kind() == SsdpMessageKind::SearchRequest {
            self.process_search_request(received);
        }
    }

    /// Machine à états M-SEARCH : validation de ST, dédup, normalisation de
    /// MX, puis réponse différée sur une tâche dédiée.
    fn process_search_request(self: &Arc<Self>, received: ReceivedSsdpMessage) {
        let search_target = match received.message.header(headers::ST) {
            Some(st) if !st.trim().is_empty() => st.trim().to_string(),
            _ => {
                debug!("M-SEARCH from {} without ST, ignored", received.from);
                return;
            }
        };

        if self.is_duplicate_search_request(&search_target, &received.from) {
            debug!(
                "Duplicate M-SEARCH (ST={}) from {}, ignored",
                search_target, received.from
            );
            return;
        }

        let Some(max_wait_seconds) = self.max_wait_interval(received.message.header(headers::MX))
        else {
            debug!("M-SEARCH from {} with invalid MX, ignored", received.from);
            return;
        };

        let delay_ms = {
            let mut rng = self.rng.lock().unwrap();
            let upper = (max_wait_seconds * 1000).max(MIN_RESPONSE_DELAY_MS + 1);
            rng.gen_range(MIN_RESPONSE_DELAY_MS..upper)
        };

        debug!(
            "📥 M-SEARCH (ST={}) from {}, responding in {} ms",
            search_target, received.from, delay_ms
        );

        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = publisher.cancel.cancelled() => return,
                _ = time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            if publisher.disposed.load(Ordering::SeqCst) {
                return;
            }
            publisher
                .send_search_responses(&search_target, received.from, received.local_ip)
                .await;
        });
    }

    /// Vrai si un M-SEARCH identique (même ST, même endpoint) a été vu il y
    /// a moins de 500 ms. Enregistre ou rafraîchit l'entrée sinon.
    fn is_duplicate_search_request(&self, search_target: &str, endpoint: &SocketAddr) -> bool {
        let key = format!("{}:{}", search_target, endpoint);
        let mut recent = self.recent_searches.lock().unwrap();

        if let Some(received_at) = recent.get(&key) {
            if received_at.elapsed() < SEARCH_DEDUP_WINDOW {
                return true;
            }
        }
        recent.insert(key, Instant::now());

        if recent.len() > SEARCH_DEDUP_SWEEP_THRESHOLD {
            recent.retain(|_, received_at| received_at.elapsed() <= SEARCH_DEDUP_WINDOW);
        }
        false
    }

    /// Normalise le header MX en secondes d'attente maximale.
    ///
    /// Absent ou vide : 1. Illisible ou ≤ 0 : `None`, la requête est
    /// abandonnée. Au-delà de 120 : remplacé par un tirage uniforme dans
    /// [0, 120).
    fn max_wait_interval(&self, mx_header: Option<&str>) -> Option<u64> {
        let raw = match mx_header {
            Some(value) if !value.trim().is_empty() => value.trim(),
            _ => "1",
        };
        let seconds = raw.parse::<i64>().ok()?;
        if seconds <= 0 {
            return None;
        }
        if seconds > MAX_MX_SECONDS {
            let mut rng = self.rng.lock().unwrap();
            return Some(rng.gen_range(0..MAX_MX_SECONDS) as u64);
        }
        Some(seconds as u64)
    }

    /// Fan-out des réponses : snapshot du registre hors verrou, matching
    /// §device, puis une réponse unicast par paire (ST, USN).
    async fn send_search_responses(
        &self,
        search_target: &str,
        requester: SocketAddr,
        local_ip: Ipv4Addr,
    ) {
        let roots = { self.devices.lock().unwrap().clone() };

        for root in roots {
            if self.options.send_only_matched_host && root.address() != local_ip {
                continue;
            }
            for device in flatten_tree(&root) {
                for (st, usn) in
                    search_response_pairs(&device, search_target, self.options.support_pnp_root_device)
                {
                    let response = self.build_search_response(&root, &st, &usn);
                    if let Err(e) = self
                        .comms
                        .send_unicast(response.to_bytes(), requester, local_ip, &self.cancel)
                        .await
                    {
                        warn!("❌ Failed to send M-SEARCH response to {}: {}", requester, e);
                    } else {
                        info!("📡 M-SEARCH response sent to {} (ST={})", requester, st);
                    }
                }
            }
        }
    }

    fn build_search_response(
        &self,
        root: &Arc<SsdpRootDevice>,
        st: &str,
        usn: &str,
    ) -> SsdpMessage {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        SsdpMessage::new(SsdpMessageKind::SearchResponse)
            .with_header(headers::EXT, "")
            .with_header(headers::DATE, date)
            .with_header(headers::HOST, multicast_host_header())
            .with_header(
                headers::CACHE_CONTROL,
                format!("max-age = {}", root.cache_lifetime().as_secs()),
            )
            .with_header(headers::ST, st)
            .with_header(headers::SERVER, self.options.server_signature())
            .with_header(headers::USN, usn)
            .with_header(headers::LOCATION, root.location().as_str())
    }

    /// Une passe d'annonces alive pour tout le registre.
    async fn send_all_alive_notifications(&self) {
        let roots = { self.devices.lock().unwrap().clone() };
        for root in roots {
            self.send_alive_notifications_for(&root).await;
        }
    }

    /// Annonces alive d'un arbre : chaque device, chaque paire (NT, USN),
    /// dans l'ordre d'énumération.
    async fn send_alive_notifications_for(&self, root: &Arc<SsdpRootDevice>) {
        for device in flatten_tree(root) {
            for (nt, usn) in notification_pairs(&device, self.options.support_pnp_root_device) {
                let message = SsdpMessage::new(SsdpMessageKind::NotifyRequest)
                    .with_header(headers::HOST, multicast_host_header())
                    .with_header(
                        headers::CACHE_CONTROL,
                        format!("max-age = {}", root.cache_lifetime().as_secs()),
                    )
                    .with_header(headers::LOCATION, root.location().as_str())
                    .with_header(headers::NT, &nt)
                    .with_header(headers::NTS, nts::ALIVE)
                    .with_header(headers::SERVER, self.options.server_signature())
                    .with_header(headers::USN, &usn);

                match self
                    .comms
                    .send_multicast(message.to_bytes(), 1, None, &self.cancel)
                    .await
                {
                    Ok(()) => info!("✅ NOTIFY alive: {} (NT={})", usn, nt),
                    Err(e) => warn!("❌ Failed to send NOTIFY alive for {}: {}", usn, e),
                }
            }
        }
    }

    /// Annonces byebye d'un arbre : mêmes paires (NT, USN) que l'alive.
    async fn send_byebye_notifications_for(
        &self,
        root: &Arc<SsdpRootDevice>,
        send_count: usize,
        cancel: &CancellationToken,
    ) {
        for device in flatten_tree(root) {
            for (nt, usn) in notification_pairs(&device, self.options.support_pnp_root_device) {
                let message = SsdpMessage::new(SsdpMessageKind::NotifyRequest)
                    .with_header(headers::HOST, multicast_host_header())
                    .with_header(headers::NT, &nt)
                    .with_header(headers::NTS, nts::BYEBYE)
                    .with_header(headers::USN, &usn);

                match self
                    .comms
                    .send_multicast(message.to_bytes(), send_count, None, cancel)
                    .await
                {
                    Ok(()) => info!("👋 NOTIFY byebye: {} (NT={})", usn, nt),
                    Err(e) => warn!("❌ Failed to send NOTIFY byebye for {}: {}", usn, e),
                }
            }
        }
    }
}

impl Drop for SsdpPublisher {
    fn drop(&mut self) {
        // Arrêt best-effort : les byebye demandent un shutdown() explicite.
        self.cancel.cancel();
        if let Ok(mut guard) = self.heartbeat.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use url::Url;

    use super::*;
    use crate::device::{SsdpDeviceProperties, SsdpEmbeddedDevice};
    use crate::transport::mock::{MockCommsServer, SentDatagram};

    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    fn requester() -> SocketAddr {
        "10.0.0.5:12345".parse().unwrap()
    }

    fn test_root(uuid: &str) -> Arc<SsdpRootDevice> {
        SsdpRootDevice::new(
            SsdpDeviceProperties::new(uuid, "Basic", "Device de test"),
            Url::parse("http://h/d.xml").unwrap(),
            Duration::from_secs(1800),
            LOCAL_IP,
        )
    }

    async fn test_publisher(
        comms: &Arc<MockCommsServer>,
        options: SsdpPublisherOptions,
    ) -> Arc<SsdpPublisher> {
        SsdpPublisher::new(comms.clone() as Arc<dyn SsdpCommunicationsServer>, options)
            .await
            .unwrap()
    }

    fn msearch(st: &str, mx: Option<&str>) -> SsdpMessage {
        let mut msg = SsdpMessage::new(SsdpMessageKind::SearchRequest)
            .with_header(headers::HOST, "239.255.255.250:1900")
            .with_header(headers::MAN, "\"ssdp:discover\"")
            .with_header(headers::ST, st);
        if let Some(mx) = mx {
            msg.set_header(headers::MX, mx);
        }
        msg
    }

    fn multicast_notifies(comms: &Arc<MockCommsServer>) -> Vec<SsdpMessage> {
        comms
            .sent_snapshot()
            .iter()
            .filter(|d| matches!(d, SentDatagram::Multicast { .. }))
            .map(|d| d.message())
            .collect()
    }

    fn unicast_responses(comms: &Arc<MockCommsServer>) -> Vec<SsdpMessage> {
        comms
            .sent_snapshot()
            .iter()
            .filter(|d| matches!(d, SentDatagram::Unicast { .. }))
            .map(|d| d.message())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_rejects_empty_os_name() {
        let comms = MockCommsServer::new(false);
        let result = SsdpPublisher::new(
            comms as Arc<dyn SsdpCommunicationsServer>,
            SsdpPublisherOptions::new("", "1.0"),
        )
        .await;
        assert!(matches!(result, Err(SsdpError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_starts_multicast_listening() {
        let comms = MockCommsServer::new(false);
        let _publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        assert!(comms.multicast_listening.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_alive_sweep_emits_four_notifies() {
        // Scénario : une racine avec pnp:rootdevice actif → 4 NOTIFY alive.
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;

        publisher.add_device(test_root("u")).await.unwrap();

        let notifies = multicast_notifies(&comms);
        assert_eq!(notifies.len(), 4);

        let nts: Vec<&str> = notifies.iter().map(|m| m.header(headers::NT).unwrap()).collect();
        assert_eq!(
            nts,
            vec![
                "upnp:rootdevice",
                "pnp:rootdevice",
                "uuid:u",
                "urn:schemas-upnp-org:device:Basic:1"
            ]
        );

        let usns: Vec<&str> = notifies.iter().map(|m| m.header(headers::USN).unwrap()).collect();
        assert_eq!(
            usns,
            vec![
                "uuid:u::upnp:rootdevice",
                "uuid:u::pnp:rootdevice",
                "uuid:u",
                "uuid:u::urn:schemas-upnp-org:device:Basic:1"
            ]
        );

        for msg in &notifies {
            assert_eq!(msg.kind(), SsdpMessageKind::NotifyRequest);
            assert_eq!(msg.header(headers::HOST), Some("239.255.255.250:1900"));
            assert_eq!(msg.header(headers::CACHE_CONTROL), Some("max-age = 1800"));
            assert_eq!(msg.header(headers::NTS), Some("ssdp:alive"));
            assert_eq!(msg.header(headers::LOCATION), Some("http://h/d.xml"));
            assert!(msg
                .header(headers::SERVER)
                .unwrap()
                .starts_with("Linux/6.1 UPnP/1.0 RSSDP/"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_alive_sweep_includes_embedded_children() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;

        let root = test_root("u");
        root.add_child(SsdpEmbeddedDevice::new(SsdpDeviceProperties::new(
            "e1", "Dimming", "Enfant",
        )))
        .unwrap();
        publisher.add_device(root).await.unwrap();

        // 4 paires racine + 2 paires par descendant.
        assert_eq!(multicast_notifies(&comms).len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_device_is_idempotent() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;

        let root = test_root("u");
        publisher.add_device(root.clone()).await.unwrap();
        comms.clear_sent();
        publisher.add_device(root).await.unwrap();

        // Second ajout : ni doublon dans le registre, ni nouvelle annonce.
        assert_eq!(publisher.devices().len(), 1);
        assert!(comms.sent_snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_sends_byebye_three_times() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;

        let root = test_root("u");
        publisher.add_device(root.clone()).await.unwrap();
        comms.clear_sent();

        publisher.remove_device(&root).await.unwrap();

        let sent = comms.sent_snapshot();
        assert_eq!(sent.len(), 4);
        for datagram in &sent {
            let SentDatagram::Multicast { send_count, .. } = datagram else {
                panic!("byebye must be multicast");
            };
            assert_eq!(*send_count, 3);
            let msg = datagram.message();
            assert_eq!(msg.header(headers::NTS), Some("ssdp:byebye"));
            // Byebye : mêmes NT que l'alive, pas de LOCATION ni CACHE-CONTROL.
            assert!(msg.header(headers::LOCATION).is_none());
            assert!(msg.header(headers::CACHE_CONTROL).is_none());
        }
        assert!(publisher.devices().is_empty());

        // Retrait d'un non-membre : no-op.
        comms.clear_sent();
        publisher.remove_device(&test_root("u")).await.unwrap();
        assert!(comms.sent_snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_round_trip() {
        // Scénario : M-SEARCH upnp:rootdevice MX 2 → une réponse unicast par
        // racine, entre 16 ms et 2000 ms après la requête.
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        comms.inject_request(msearch("upnp:rootdevice", Some("2")), requester(), LOCAL_IP);

        // Avant la borne basse du délai : rien.
        time::sleep(Duration::from_millis(15)).await;
        assert!(unicast_responses(&comms).is_empty());

        // À la borne haute : exactement une réponse.
        time::sleep(Duration::from_millis(2000)).await;
        let responses = unicast_responses(&comms);
        assert_eq!(responses.len(), 1);

        let response = &responses[0];
        assert_eq!(response.kind(), SsdpMessageKind::SearchResponse);
        assert_eq!(response.header(headers::ST), Some("upnp:rootdevice"));
        assert_eq!(response.header(headers::USN), Some("uuid:u::upnp:rootdevice"));
        assert_eq!(response.header(headers::EXT), Some(""));
        assert_eq!(response.header(headers::HOST), Some("239.255.255.250:1900"));
        assert_eq!(response.header(headers::CACHE_CONTROL), Some("max-age = 1800"));
        assert_eq!(response.header(headers::LOCATION), Some("http://h/d.xml"));
        assert!(response.header(headers::DATE).is_some());

        let SentDatagram::Unicast { dest, from_local_ip, .. } = &comms.sent_snapshot()[0] else {
            panic!("search response must be unicast");
        };
        assert_eq!(*dest, requester());
        assert_eq!(*from_local_ip, LOCAL_IP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_without_st_is_dropped() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        let msg = SsdpMessage::new(SsdpMessageKind::SearchRequest).with_header(headers::MX, "1");
        comms.inject_request(msg, requester(), LOCAL_IP);
        time::sleep(Duration::from_secs(3)).await;
        assert!(unicast_responses(&comms).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_with_invalid_mx_is_dropped() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        // Endpoints distincts pour que chaque requête passe la dédup et
        // soit jugée sur son MX.
        for (port, mx) in [(20000, "0"), (20001, "-3"), (20002, "abc"), (20003, "1.5")] {
            let endpoint: SocketAddr = format!("10.0.0.5:{}", port).parse().unwrap();
            comms.inject_request(msearch("ssdp:all", Some(mx)), endpoint, LOCAL_IP);
        }
        time::sleep(Duration::from_secs(130)).await;
        assert!(unicast_responses(&comms).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_with_missing_mx_is_treated_as_one_second() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        comms.inject_request(msearch("upnp:rootdevice", None), requester(), LOCAL_IP);
        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(unicast_responses(&comms).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_with_huge_mx_responds_within_clamped_window() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        comms.inject_request(msearch("upnp:rootdevice", Some("10000")), requester(), LOCAL_IP);
        // MX > 120 est remplacé par un tirage dans [0, 120) secondes.
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(unicast_responses(&comms).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_search_suppression_window() {
        // Scénario : deux M-SEARCH identiques à 100 ms → une seule salve ;
        // une troisième 600 ms plus tard → une seconde salve.
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        comms.inject_request(msearch("upnp:rootdevice", Some("1")), requester(), LOCAL_IP);
        time::sleep(Duration::from_millis(100)).await;
        comms.inject_request(msearch("upnp:rootdevice", Some("1")), requester(), LOCAL_IP);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(unicast_responses(&comms).len(), 1);

        // 600 ms après la dernière requête : l'entrée de dédup est périmée.
        comms.inject_request(msearch("upnp:rootdevice", Some("1")), requester(), LOCAL_IP);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(unicast_responses(&comms).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_endpoints_are_not_deduplicated() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        comms.inject_request(msearch("upnp:rootdevice", Some("1")), requester(), LOCAL_IP);
        comms.inject_request(
            msearch("upnp:rootdevice", Some("1")),
            "10.0.0.6:12345".parse().unwrap(),
            LOCAL_IP,
        );
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(unicast_responses(&comms).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_matched_host_filters_responses() {
        let comms = MockCommsServer::new(false);
        let options =
            SsdpPublisherOptions::new("Linux", "6.1").set_send_only_matched_host(true);
        let publisher = test_publisher(&comms, options).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        // Arrivée sur une interface qui n'est pas celle du device : silence.
        comms.inject_request(
            msearch("upnp:rootdevice", Some("1")),
            requester(),
            Ipv4Addr::new(172, 16, 0, 1),
        );
        time::sleep(Duration::from_secs(2)).await;
        assert!(unicast_responses(&comms).is_empty());

        // Arrivée sur la bonne interface : réponse.
        comms.inject_request(msearch("upnp:rootdevice", Some("1")), requester(), LOCAL_IP);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(unicast_responses(&comms).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ssdp_all_search_returns_every_pair() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;

        let root = test_root("u");
        root.add_child(SsdpEmbeddedDevice::new(SsdpDeviceProperties::new(
            "e1", "Dimming", "Enfant",
        )))
        .unwrap();
        publisher.add_device(root).await.unwrap();
        comms.clear_sent();

        comms.inject_request(msearch("ssdp:all", Some("1")), requester(), LOCAL_IP);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(unicast_responses(&comms).len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_first_fires_after_five_seconds() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        publisher
            .start_sending_alive_notifications(Duration::from_secs(60))
            .unwrap();

        time::sleep(Duration::from_millis(4900)).await;
        assert!(multicast_notifies(&comms).is_empty());

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(multicast_notifies(&comms).len(), 4);

        // Tick périodique suivant.
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(multicast_notifies(&comms).len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_rejects_zero_interval() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        assert!(matches!(
            publisher.start_sending_alive_notifications(Duration::ZERO),
            Err(SsdpError::InvalidInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sends_single_byebye_and_rejects_operations() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        comms.clear_sent();

        publisher.shutdown().await;

        let sent = comms.sent_snapshot();
        assert_eq!(sent.len(), 4);
        for datagram in &sent {
            let SentDatagram::Multicast { send_count, .. } = datagram else {
                panic!("byebye must be multicast");
            };
            assert_eq!(*send_count, 1);
            assert_eq!(datagram.message().header(headers::NTS), Some("ssdp:byebye"));
        }
        assert!(comms.shutdown_called.load(Ordering::SeqCst));

        // Après l'arrêt : les opérations échouent, les requêtes sont ignorées.
        assert!(matches!(
            publisher.add_device(test_root("v")).await,
            Err(SsdpError::Disposed)
        ));
        comms.clear_sent();
        comms.inject_request(msearch("ssdp:all", Some("1")), requester(), LOCAL_IP);
        time::sleep(Duration::from_secs(2)).await;
        assert!(comms.sent_snapshot().is_empty());

        // Idempotent.
        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_transport_is_not_shut_down() {
        let comms = MockCommsServer::new(true);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.shutdown().await;
        assert!(!comms.shutdown_called.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_during_shutdown_are_dropped() {
        let comms = MockCommsServer::new(false);
        let publisher = test_publisher(&comms, SsdpPublisherOptions::new("Linux", "6.1")).await;
        publisher.add_device(test_root("u")).await.unwrap();
        publisher
            .start_sending_alive_notifications(Duration::from_secs(60))
            .unwrap();

        publisher.shutdown().await;
        comms.clear_sent();

        time::sleep(Duration::from_secs(120)).await;
        assert!(comms.sent_snapshot().is_empty());
    }
}
