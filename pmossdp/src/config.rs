//! Options de configuration du publisher et du locator.
//!
//! Structures sérialisables pour que l'application hôte puisse les charger
//! depuis sa propre configuration.

use serde::{Deserialize, Serialize};

use crate::errors::SsdpError;
use crate::product_signature;

fn default_true() -> bool {
    true
}

/// Options du [`SsdpPublisher`](crate::SsdpPublisher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsdpPublisherOptions {
    /// Nom d'OS inséré dans le header SERVER. Requis, non vide.
    pub os_name: String,
    /// Version d'OS insérée dans le header SERVER. Requis, non vide.
    pub os_version: String,
    /// Annonce aussi le type hérité `pnp:rootdevice` pour les racines.
    #[serde(default = "default_true")]
    pub support_pnp_root_device: bool,
    /// Ne répond aux M-SEARCH que sur l'interface dont l'IP correspond à
    /// l'adresse configurée du device racine.
    #[serde(default)]
    pub send_only_matched_host: bool,
}

impl SsdpPublisherOptions {
    pub fn new(os_name: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            os_name: os_name.into(),
            os_version: os_version.into(),
            support_pnp_root_device: true,
            send_only_matched_host: false,
        }
    }

    pub fn set_support_pnp_root_device(mut self, enabled: bool) -> Self {
        self.support_pnp_root_device = enabled;
        self
    }

    pub fn set_send_only_matched_host(mut self, enabled: bool) -> Self {
        self.send_only_matched_host = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SsdpError> {
        if self.os_name.trim().is_empty() {
            return Err(SsdpError::InvalidInput(
                "os_name must not be empty".to_string(),
            ));
        }
        if self.os_version.trim().is_empty() {
            return Err(SsdpError::InvalidInput(
                "os_version must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Valeur du header SERVER.
    pub(crate) fn server_signature(&self) -> String {
        product_signature(&self.os_name, &self.os_version)
    }
}

/// Options du [`SsdpLocator`](crate::SsdpLocator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsdpLocatorOptions {
    /// Nom d'OS inséré dans le header USER-AGENT. Requis, non vide.
    pub os_name: String,
    /// Version d'OS insérée dans le header USER-AGENT. Requis, non vide.
    pub os_version: String,
    /// Filtre des événements : `None`, vide ou `ssdp:all` laisse tout
    /// passer ; sinon seuls les devices dont le type de notification est
    /// exactement égal au filtre déclenchent des événements. Le cache est
    /// alimenté dans tous les cas.
    #[serde(default)]
    pub notification_filter: Option<String>,
}

impl SsdpLocatorOptions {
    pub fn new(os_name: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            os_name: os_name.into(),
            os_version: os_version.into(),
            notification_filter: None,
        }
    }

    pub fn set_notification_filter(mut self, filter: impl Into<String>) -> Self {
        self.notification_filter = Some(filter.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SsdpError> {
        if self.os_name.trim().is_empty() {
            return Err(SsdpError::InvalidInput(
                "os_name must not be empty".to_string(),
            ));
        }
        if self.os_version.trim().is_empty() {
            return Err(SsdpError::InvalidInput(
                "os_version must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Valeur du header USER-AGENT.
    pub(crate) fn user_agent(&self) -> String {
        product_signature(&self.os_name, &self.os_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_defaults() {
        let options = SsdpPublisherOptions::new("Linux", "6.1");
        assert!(options.support_pnp_root_device);
        assert!(!options.send_only_matched_host);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_os_fields_are_rejected() {
        assert!(SsdpPublisherOptions::new("", "6.1").validate().is_err());
        assert!(SsdpPublisherOptions::new("Linux", " ").validate().is_err());
        assert!(SsdpLocatorOptions::new("", "1").validate().is_err());
    }

    #[test]
    fn test_server_signature_format() {
        let signature = SsdpPublisherOptions::new("Linux", "6.1").server_signature();
        assert!(signature.starts_with("Linux/6.1 UPnP/1.0 RSSDP/"));
    }
}
