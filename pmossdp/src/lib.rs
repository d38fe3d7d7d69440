//! # pmossdp - Couche de découverte SSDP pour UPnP
//!
//! Cette crate implémente le protocole SSDP (Simple Service Discovery Protocol),
//! la couche de découverte d'UPnP 1.0/1.1. Elle fournit deux points d'accès
//! coordonnés sur un transport HTTPU/UDP partageable :
//!
//! - [`SsdpPublisher`] : annonce un arbre de devices UPnP (root + embedded) par
//!   NOTIFY `ssdp:alive` périodiques en multicast, répond aux M-SEARCH en
//!   unicast, et émet `ssdp:byebye` au retrait ou à l'arrêt.
//! - [`SsdpLocator`] : émet des M-SEARCH en multicast, écoute les NOTIFY,
//!   maintient un cache borné par TTL des devices découverts et publie des
//!   événements de disponibilité.
//!
//! ## Architecture
//!
//! ```text
//! pmossdp
//!     ├── message/    - Codec HTTPU (start-line + headers, CRLF)
//!     ├── device/     - Modèle de devices root/embedded et énumération NT/USN
//!     ├── transport/  - Serveur de communications (sockets multicast/unicast)
//!     ├── publisher   - Annonces alive/byebye + réponses M-SEARCH
//!     └── locator     - Cache de découverte + événements Available/Unavailable
//! ```
//!
//! Le transport est une interface ([`SsdpCommunicationsServer`]) consommée par
//! le publisher et le locator ; un binding UDP concret
//! ([`UdpSsdpCommunicationsServer`]) est fourni. Un même transport peut être
//! partagé entre un publisher et un locator (flag `shared`).
//!
//! ## Constantes SSDP
//!
//! - **Adresse multicast** : 239.255.255.250:1900
//! - **Max-Age par défaut** : 1800 secondes (30 minutes)
//!
//! Les handlers d'événements tournent sur des tâches tokio arbitraires ;
//! aucune garantie de thread n'est donnée aux abonnés.

mod config;
mod errors;

pub mod device;
pub mod locator;
pub mod message;
pub mod publisher;
pub mod transport;

pub use config::{SsdpLocatorOptions, SsdpPublisherOptions};
pub use device::{
    SsdpDeviceProperties, SsdpDeviceRef, SsdpDeviceTreeEvent, SsdpEmbeddedDevice, SsdpRootDevice,
};
pub use errors::SsdpError;
pub use locator::{DiscoveredSsdpDevice, SsdpDiscoveryEvent, SsdpLocator};
pub use message::{SsdpMessage, SsdpMessageKind};
pub use publisher::SsdpPublisher;
pub use transport::{ReceivedSsdpMessage, SsdpCommunicationsServer, UdpSsdpCommunicationsServer};

/// Adresse multicast SSDP
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";

/// Port SSDP
pub const SSDP_PORT: u16 = 1900;

/// Durée de validité par défaut des annonces (en secondes)
pub const DEFAULT_MAX_AGE: u32 = 1800;

/// Valeur du header HOST pour tous les messages multicast
pub(crate) fn multicast_host_header() -> String {
    format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
}

/// Signature produit pour les headers SERVER et USER-AGENT
pub(crate) fn product_signature(os_name: &str, os_version: &str) -> String {
    format!(
        "{}/{} UPnP/1.0 RSSDP/{}",
        os_name,
        os_version,
        env!("CARGO_PKG_VERSION")
    )
}
