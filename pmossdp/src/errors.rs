//! Erreurs de la crate pmossdp

use thiserror::Error;

/// Erreurs publiques du publisher, du locator et du modèle de devices.
///
/// Seules les erreurs de validation d'entrée, de cycle de vie et d'invariant
/// de l'arbre de devices remontent aux appelants. Les erreurs d'envoi réseau
/// et de parsing wire sont absorbées par les handlers (le protocole tolère la
/// perte de datagrammes par construction).
#[derive(Error, Debug)]
pub enum SsdpError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Instance has been disposed")]
    Disposed,

    #[error("Device tree error: {0}")]
    DeviceTree(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
