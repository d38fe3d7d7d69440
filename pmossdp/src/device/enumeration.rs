//! Énumération des paires (NT/ST, USN) et matching des cibles de recherche.

use std::sync::Arc;

use super::{SsdpDeviceRef, SsdpEmbeddedDevice, SsdpRootDevice};

/// Cible de recherche désignant tous les devices.
pub(crate) const ST_ALL: &str = "ssdp:all";
/// Cible de recherche désignant les devices racine.
pub(crate) const ST_UPNP_ROOT: &str = "upnp:rootdevice";
/// Variante héritée de `upnp:rootdevice`, annoncée sur option.
pub(crate) const ST_PNP_ROOT: &str = "pnp:rootdevice";

/// Aplatit un arbre de devices en profondeur d'abord : la racine, puis
/// chaque enfant suivi de sa descendance, dans l'ordre de déclaration.
pub fn flatten_tree(root: &Arc<SsdpRootDevice>) -> Vec<SsdpDeviceRef> {
    let mut out = vec![SsdpDeviceRef::Root(root.clone())];
    for child in root.children() {
        walk(child, &mut out);
    }
    out
}

fn walk(device: Arc<SsdpEmbeddedDevice>, out: &mut Vec<SsdpDeviceRef>) {
    out.push(SsdpDeviceRef::Embedded(device.clone()));
    for child in device.children() {
        walk(child, out);
    }
}

/// Paires (NT, USN) annoncées pour un device, dans l'ordre d'émission :
///
/// 1. pour une racine seulement : `upnp:rootdevice` puis, sur option,
///    `pnp:rootdevice` ;
/// 2. pour tout device : l'identité (`udn`, `udn`) puis le type complet
///    (`type`, `{udn}::{type}`).
pub fn notification_pairs(
    device: &SsdpDeviceRef,
    support_pnp_root_device: bool,
) -> Vec<(String, String)> {
    let props = device.properties();
    let udn = props.udn();
    let full_type = props.full_device_type();

    let mut pairs = Vec::with_capacity(4);
    if device.is_root() {
        pairs.push((
            ST_UPNP_ROOT.to_string(),
            format!("{}::{}", udn, ST_UPNP_ROOT),
        ));
        if support_pnp_root_device {
            pairs.push((ST_PNP_ROOT.to_string(), format!("{}::{}", udn, ST_PNP_ROOT)));
        }
    }
    pairs.push((udn.clone(), udn.clone()));
    pairs.push((full_type.clone(), format!("{}::{}", udn, full_type)));
    pairs
}

/// Paires (ST, USN) à émettre en réponse à un M-SEARCH pour ce device.
///
/// Vide si le device ne correspond pas à la cible :
///
/// - `ssdp:all` : toutes les paires d'annonce du device ;
/// - `upnp:rootdevice` / `pnp:rootdevice` : racines seulement ;
/// - `uuid:XYZ` : devices dont l'UUID vaut XYZ (insensible à la casse) ;
/// - `urn:...` : devices dont le type complet vaut la cible (insensible à la
///   casse) ;
/// - toute autre valeur : aucun match.
pub fn search_response_pairs(
    device: &SsdpDeviceRef,
    search_target: &str,
    support_pnp_root_device: bool,
) -> Vec<(String, String)> {
    let st = search_target.trim();
    let props = device.properties();
    let udn = props.udn();

    if st.eq_ignore_ascii_case(ST_ALL) {
        return notification_pairs(device, support_pnp_root_device);
    }

    if st.eq_ignore_ascii_case(ST_UPNP_ROOT) {
        if device.is_root() {
            return vec![(
                ST_UPNP_ROOT.to_string(),
                format!("{}::{}", udn, ST_UPNP_ROOT),
            )];
        }
        return Vec::new();
    }

    if support_pnp_root_device && st.eq_ignore_ascii_case(ST_PNP_ROOT) {
        if device.is_root() {
            return vec![(ST_PNP_ROOT.to_string(), format!("{}::{}", udn, ST_PNP_ROOT))];
        }
        return Vec::new();
    }

    if let Some(uuid) = strip_prefix_ignore_case(st, "uuid:") {
        if props.uuid().eq_ignore_ascii_case(uuid) {
            return vec![(udn.clone(), udn)];
        }
        return Vec::new();
    }

    if strip_prefix_ignore_case(st, "urn:").is_some() {
        let full_type = props.full_device_type();
        if full_type.eq_ignore_ascii_case(st) {
            return vec![(full_type.clone(), format!("{}::{}", udn, full_type))];
        }
    }

    Vec::new()
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}
