//! # Module Device - Modèle de devices UPnP pour SSDP
//!
//! Représente les arbres de devices annoncés par le publisher : un
//! [`SsdpRootDevice`] possède ses enfants [`SsdpEmbeddedDevice`], chaque
//! enfant portant une référence non-possédante vers sa racine. Un device
//! embedded appartient à exactement un arbre : le rattacher à une seconde
//! racine échoue.
//!
//! L'énumération des paires (NT, USN) et le matching des cibles de recherche
//! sont dans [`enumeration`].

mod enumeration;

pub use enumeration::{flatten_tree, notification_pairs, search_response_pairs};

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;

use crate::errors::SsdpError;

const TREE_EVENT_CAPACITY: usize = 16;

/// Propriétés communes à tous les devices (root ou embedded).
///
/// Le type complet est dérivé : `urn:{namespace}:{class}:{type}:{version}`,
/// et l'UDN vaut `uuid:{uuid}` sauf s'il est explicitement surchargé.
#[derive(Debug, Clone)]
pub struct SsdpDeviceProperties {
    uuid: String,
    device_type: String,
    type_namespace: String,
    type_version: u32,
    device_class: String,
    friendly_name: String,
    manufacturer: String,
    model_name: String,
    model_number: Option<String>,
    udn_override: Option<String>,
}

impl SsdpDeviceProperties {
    /// Crée des propriétés de device.
    ///
    /// # Arguments
    ///
    /// * `uuid` - UUID du device, sans le préfixe "uuid:"
    /// * `device_type` - Type UPnP court (ex: "Basic", "MediaRenderer")
    /// * `friendly_name` - Nom convivial pour l'utilisateur
    pub fn new(
        uuid: impl Into<String>,
        device_type: impl Into<String>,
        friendly_name: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            device_type: device_type.into(),
            type_namespace: "schemas-upnp-org".to_string(),
            type_version: 1,
            device_class: "device".to_string(),
            friendly_name: friendly_name.into(),
            manufacturer: String::new(),
            model_name: String::new(),
            model_number: None,
            udn_override: None,
        }
    }

    /// Comme [`SsdpDeviceProperties::new`] avec un UUID v4 généré.
    pub fn with_generated_uuid(
        device_type: impl Into<String>,
        friendly_name: impl Into<String>,
    ) -> Self {
        Self::new(Uuid::new_v4().to_string(), device_type, friendly_name)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_number(&self) -> Option<&str> {
        self.model_number.as_deref()
    }

    /// Définit l'espace de noms du type (défaut: "schemas-upnp-org").
    pub fn set_type_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.type_namespace = namespace.into();
        self
    }

    /// Définit la version du type (défaut: 1).
    pub fn set_type_version(mut self, version: u32) -> Self {
        self.type_version = version;
        self
    }

    /// Définit la classe URN (défaut: "device").
    pub fn set_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = class.into();
        self
    }

    pub fn set_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn set_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn set_model_number(mut self, model_number: impl Into<String>) -> Self {
        self.model_number = Some(model_number.into());
        self
    }

    /// Surcharge l'UDN dérivé (`uuid:{uuid}`).
    pub fn set_udn(mut self, udn: impl Into<String>) -> Self {
        self.udn_override = Some(udn.into());
        self
    }

    /// UDN du device : `uuid:{uuid}`, sauf surcharge explicite.
    pub fn udn(&self) -> String {
        match &self.udn_override {
            Some(udn) => udn.clone(),
            None => format!("uuid:{}", self.uuid),
        }
    }

    /// Type complet : `urn:{namespace}:{class}:{type}:{version}`.
    pub fn full_device_type(&self) -> String {
        format!(
            "urn:{}:{}:{}:{}",
            self.type_namespace, self.device_class, self.device_type, self.type_version
        )
    }
}

/// Événements de modification d'un arbre de devices.
#[derive(Debug, Clone)]
pub enum SsdpDeviceTreeEvent {
    /// Un device embedded a été rattaché au device émetteur.
    DeviceAdded(Arc<SsdpEmbeddedDevice>),
    /// Un device embedded a été détaché du device émetteur.
    DeviceRemoved(Arc<SsdpEmbeddedDevice>),
}

/// Device racine d'un arbre UPnP.
///
/// Porte l'URL de description, la durée de validité des annonces et
/// l'adresse IP de l'interface qui héberge la description.
#[derive(Debug)]
pub struct SsdpRootDevice {
    properties: SsdpDeviceProperties,
    location: Url,
    cache_lifetime: Duration,
    address: Ipv4Addr,
    children: RwLock<Vec<Arc<SsdpEmbeddedDevice>>>,
    tree_events: broadcast::Sender<SsdpDeviceTreeEvent>,
}

impl SsdpRootDevice {
    pub fn new(
        properties: SsdpDeviceProperties,
        location: Url,
        cache_lifetime: Duration,
        address: Ipv4Addr,
    ) -> Arc<Self> {
        Arc::new(Self {
            properties,
            location,
            cache_lifetime,
            address,
            children: RwLock::new(Vec::new()),
            tree_events: broadcast::channel(TREE_EVENT_CAPACITY).0,
        })
    }

    pub fn properties(&self) -> &SsdpDeviceProperties {
        &self.properties
    }

    /// URL du document de description du device.
    pub fn location(&self) -> &Url {
        &self.location
    }

    /// Durée de validité annoncée (`CACHE-CONTROL: max-age`).
    pub fn cache_lifetime(&self) -> Duration {
        self.cache_lifetime
    }

    /// Adresse IP locale associée à ce device.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Enfants directs, dans l'ordre de déclaration.
    pub fn children(&self) -> Vec<Arc<SsdpEmbeddedDevice>> {
        self.children.read().unwrap().clone()
    }

    /// S'abonne aux événements d'ajout/retrait sur ce device.
    pub fn subscribe_tree_events(&self) -> broadcast::Receiver<SsdpDeviceTreeEvent> {
        self.tree_events.subscribe()
    }

    /// Rattache un device embedded à cette racine.
    ///
    /// Idempotent par UDN. Échoue si l'enfant appartient déjà à un autre
    /// arbre.
    pub fn add_child(
        self: &Arc<Self>,
        child: Arc<SsdpEmbeddedDevice>,
    ) -> Result<(), SsdpError> {
        child.claim_root(self)?;
        attach_child(&self.children, &self.tree_events, child);
        Ok(())
    }

    /// Détache un enfant direct par UDN. Sans effet si l'UDN est inconnu.
    pub fn remove_child(&self, udn: &str) {
        detach_child(&self.children, &self.tree_events, udn);
    }
}

/// Device imbriqué dans un arbre UPnP.
///
/// Conserve une référence faible vers sa racine, posée au premier
/// rattachement et jamais remplacée par une autre racine.
#[derive(Debug)]
pub struct SsdpEmbeddedDevice {
    properties: SsdpDeviceProperties,
    root: RwLock<Weak<SsdpRootDevice>>,
    children: RwLock<Vec<Arc<SsdpEmbeddedDevice>>>,
    tree_events: broadcast::Sender<SsdpDeviceTreeEvent>,
}

impl SsdpEmbeddedDevice {
    pub fn new(properties: SsdpDeviceProperties) -> Arc<Self> {
        Arc::new(Self {
            properties,
            root: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            tree_events: broadcast::channel(TREE_EVENT_CAPACITY).0,
        })
    }

    pub fn properties(&self) -> &SsdpDeviceProperties {
        &self.properties
    }

    /// Racine de l'arbre auquel ce device appartient, si rattaché.
    pub fn root(&self) -> Option<Arc<SsdpRootDevice>> {
        self.root.read().unwrap().upgrade()
    }

    /// Enfants directs, dans l'ordre de déclaration.
    pub fn children(&self) -> Vec<Arc<SsdpEmbeddedDevice>> {
        self.children.read().unwrap().clone()
    }

    /// S'abonne aux événements d'ajout/retrait sur ce device.
    pub fn subscribe_tree_events(&self) -> broadcast::Receiver<SsdpDeviceTreeEvent> {
        self.tree_events.subscribe()
    }

    /// Rattache un device embedded sous ce device.
    ///
    /// Le parent doit déjà appartenir à un arbre : l'enfant reçoit la même
    /// racine. Idempotent par UDN.
    pub fn add_child(
        self: &Arc<Self>,
        child: Arc<SsdpEmbeddedDevice>,
    ) -> Result<(), SsdpError> {
        if Arc::ptr_eq(self, &child) {
            return Err(SsdpError::DeviceTree(
                "cannot attach a device to itself".to_string(),
            ));
        }
        let root = self.root().ok_or_else(|| {
            SsdpError::DeviceTree(format!(
                "parent device {} is not attached to a root device",
                self.properties.udn()
            ))
        })?;
        child.claim_root(&root)?;
        attach_child(&self.children, &self.tree_events, child);
        Ok(())
    }

    /// Détache un enfant direct par UDN. Sans effet si l'UDN est inconnu.
    pub fn remove_child(&self, udn: &str) {
        detach_child(&self.children, &self.tree_events, udn);
    }

    /// Pose la référence vers la racine, une seule fois.
    fn claim_root(&self, root: &Arc<SsdpRootDevice>) -> Result<(), SsdpError> {
        let mut slot = self.root.write().unwrap();
        if let Some(existing) = slot.upgrade() {
            if Arc::ptr_eq(&existing, root) {
                return Ok(());
            }
            return Err(SsdpError::DeviceTree(format!(
                "device {} already belongs to root {}",
                self.properties.udn(),
                existing.properties().udn()
            )));
        }
        *slot = Arc::downgrade(root);
        Ok(())
    }

    /// Efface la référence racine au détachement.
    fn release_root(&self) {
        *self.root.write().unwrap() = Weak::new();
    }
}

fn attach_child(
    children: &RwLock<Vec<Arc<SsdpEmbeddedDevice>>>,
    events: &broadcast::Sender<SsdpDeviceTreeEvent>,
    child: Arc<SsdpEmbeddedDevice>,
) {
    let added = {
        let mut children = children.write().unwrap();
        let udn = child.properties().udn();
        if children.iter().any(|c| c.properties().udn() == udn) {
            false
        } else {
            children.push(child.clone());
            true
        }
    };
    if added {
        let _ = events.send(SsdpDeviceTreeEvent::DeviceAdded(child));
    }
}

fn detach_child(
    children: &RwLock<Vec<Arc<SsdpEmbeddedDevice>>>,
    events: &broadcast::Sender<SsdpDeviceTreeEvent>,
    udn: &str,
) {
    let removed = {
        let mut children = children.write().unwrap();
        match children.iter().position(|c| c.properties().udn() == udn) {
            Some(pos) => Some(children.remove(pos)),
            None => None,
        }
    };
    if let Some(child) = removed {
        child.release_root();
        let _ = events.send(SsdpDeviceTreeEvent::DeviceRemoved(child));
    }
}

/// Référence uniforme sur un device de l'arbre, racine ou embedded.
#[derive(Debug, Clone)]
pub enum SsdpDeviceRef {
    Root(Arc<SsdpRootDevice>),
    Embedded(Arc<SsdpEmbeddedDevice>),
}

impl SsdpDeviceRef {
    pub fn properties(&self) -> &SsdpDeviceProperties {
        match self {
            SsdpDeviceRef::Root(d) => d.properties(),
            SsdpDeviceRef::Embedded(d) => d.properties(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, SsdpDeviceRef::Root(_))
    }
}
