//! # Module Transport - Serveur de communications SSDP
//!
//! Le publisher et le locator consomment l'interface
//! [`SsdpCommunicationsServer`] : écoute multicast, envois unicast/multicast,
//! et deux flux d'événements (requêtes entrantes, réponses entrantes). La
//! classification requête/réponse se fait strictement ici, sur le premier
//! token du datagramme ; les couches hautes reçoivent des [`SsdpMessage`]
//! typés.
//!
//! Un même serveur peut être partagé entre un publisher et un locator : le
//! flag `shared` indique aux consommateurs de ne pas l'arrêter à leur propre
//! arrêt.
//!
//! Le binding UDP concret est dans [`udp`].

mod udp;

pub use udp::UdpSsdpCommunicationsServer;

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::SsdpError;
use crate::message::{SsdpMessage, SsdpMessageKind};

/// Message SSDP reçu, avec son origine et l'IP locale d'arrivée.
#[derive(Debug, Clone)]
pub struct ReceivedSsdpMessage {
    pub message: SsdpMessage,
    /// Endpoint distant émetteur du datagramme.
    pub from: SocketAddr,
    /// IP de l'interface locale sur laquelle le datagramme est arrivé.
    pub local_ip: Ipv4Addr,
}

/// Transport HTTPU partagé par le publisher et le locator.
///
/// Les envois sont de type fire-and-forget : une erreur est remontée à
/// l'appelant direct mais les handlers du publisher/locator ne la propagent
/// jamais plus haut. L'annulation interrompt l'opération en cours sans
/// toucher au reste du serveur.
#[async_trait]
pub trait SsdpCommunicationsServer: Send + Sync {
    /// Démarre l'écoute multicast (239.255.255.250:1900) sur chaque
    /// interface utilisable. Idempotent.
    async fn begin_listening_for_multicast(&self) -> Result<(), SsdpError>;

    /// Arrête l'écoute multicast. Idempotent.
    async fn stop_listening_for_multicast(&self);

    /// Envoie un datagramme unicast depuis l'interface `from_local_ip`.
    async fn send_unicast(
        &self,
        data: Vec<u8>,
        dest: SocketAddr,
        from_local_ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<(), SsdpError>;

    /// Envoie `send_count` copies du datagramme au groupe multicast.
    ///
    /// Si `from_local_ip` est `None`, émet depuis chaque interface en
    /// écoute.
    async fn send_multicast(
        &self,
        data: Vec<u8>,
        send_count: usize,
        from_local_ip: Option<Ipv4Addr>,
        cancel: &CancellationToken,
    ) -> Result<(), SsdpError>;

    /// Flux des requêtes entrantes (NOTIFY, M-SEARCH).
    fn subscribe_requests(&self) -> broadcast::Receiver<ReceivedSsdpMessage>;

    /// Flux des réponses entrantes (HTTP/1.1 200 OK).
    fn subscribe_responses(&self) -> broadcast::Receiver<ReceivedSsdpMessage>;

    /// Vrai si le serveur est partagé : un publisher/locator qui s'arrête ne
    /// doit alors pas l'arrêter.
    fn is_shared(&self) -> bool;

    /// Arrêt complet : ferme les sockets et termine les tâches de réception.
    async fn shutdown(&self);
}

/// Classifie un datagramme entrant et le pousse sur le bon flux.
///
/// Premier token `HTTP/...` : réponse ; start-line `... * HTTP/1.1` :
/// requête. Tout datagramme malformé est silencieusement ignoré.
pub(crate) fn classify_and_dispatch(
    data: &[u8],
    from: SocketAddr,
    local_ip: Ipv4Addr,
    request_tx: &broadcast::Sender<ReceivedSsdpMessage>,
    response_tx: &broadcast::Sender<ReceivedSsdpMessage>,
) {
    let Some(message) = SsdpMessage::parse(data) else {
        trace!("Dropping malformed datagram from {}", from);
        return;
    };

    let received = ReceivedSsdpMessage {
        message,
        from,
        local_ip,
    };

    // Un send sans abonné est normal (personne n'écoute encore ce flux).
    let kind = received.message.kind();
    match kind {
        SsdpMessageKind::SearchResponse => {
            let _ = response_tx.send(received);
        }
        SsdpMessageKind::NotifyRequest | SsdpMessageKind::SearchRequest => {
            let _ = request_tx.send(received);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "10.0.0.5:12345".parse().unwrap()
    }

    #[test]
    fn test_classify_response_goes_to_response_stream() {
        let (request_tx, _keep_req) = broadcast::channel(8);
        let (response_tx, mut responses) = broadcast::channel(8);

        classify_and_dispatch(
            b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n",
            endpoint(),
            Ipv4Addr::new(10, 0, 0, 1),
            &request_tx,
            &response_tx,
        );

        let received = responses.try_recv().unwrap();
        assert_eq!(received.message.kind(), SsdpMessageKind::SearchResponse);
        assert_eq!(received.from, endpoint());
    }

    #[test]
    fn test_classify_requests_go_to_request_stream() {
        let (request_tx, mut requests) = broadcast::channel(8);
        let (response_tx, mut responses) = broadcast::channel(8);

        classify_and_dispatch(
            b"M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n\r\n",
            endpoint(),
            Ipv4Addr::new(10, 0, 0, 1),
            &request_tx,
            &response_tx,
        );
        classify_and_dispatch(
            b"NOTIFY * HTTP/1.1\r\nNT: x\r\n\r\n",
            endpoint(),
            Ipv4Addr::new(10, 0, 0, 1),
            &request_tx,
            &response_tx,
        );

        assert_eq!(
            requests.try_recv().unwrap().message.kind(),
            SsdpMessageKind::SearchRequest
        );
        assert_eq!(
            requests.try_recv().unwrap().message.kind(),
            SsdpMessageKind::NotifyRequest
        );
        assert!(responses.try_recv().is_err());
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let (request_tx, mut requests) = broadcast::channel(8);
        let (response_tx, mut responses) = broadcast::channel(8);

        classify_and_dispatch(
            b"\x00\x01\x02 not http at all",
            endpoint(),
            Ipv4Addr::new(10, 0, 0, 1),
            &request_tx,
            &response_tx,
        );

        assert!(requests.try_recv().is_err());
        assert!(responses.try_recv().is_err());
    }
}
