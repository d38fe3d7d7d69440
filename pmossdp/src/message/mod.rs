//! # Module Message - Codec HTTPU
//!
//! Construction et parsing des datagrammes SSDP : une start-line HTTP, des
//! lignes `Nom: Valeur`, une ligne vide finale, le tout en ASCII avec fins de
//! ligne CRLF (syntaxe HTTP transportée sur UDP, dite HTTPU).
//!
//! Trois start-lines sont reconnues :
//!
//! - `NOTIFY * HTTP/1.1` - annonce (alive/byebye)
//! - `M-SEARCH * HTTP/1.1` - requête de découverte
//! - `HTTP/1.1 200 OK` - réponse de recherche
//!
//! Tout le reste est ignoré. La recherche de header est insensible à la
//! casse ; un header absent donne `None`, jamais une erreur.

mod parse;

pub use parse::parse_max_age;

/// Noms canoniques des headers SSDP
pub mod headers {
    pub const HOST: &str = "HOST";
    pub const CACHE_CONTROL: &str = "CACHE-CONTROL";
    pub const LOCATION: &str = "LOCATION";
    pub const NT: &str = "NT";
    pub const NTS: &str = "NTS";
    pub const USN: &str = "USN";
    pub const ST: &str = "ST";
    pub const MX: &str = "MX";
    pub const MAN: &str = "MAN";
    pub const EXT: &str = "EXT";
    pub const SERVER: &str = "SERVER";
    pub const DATE: &str = "DATE";
    pub const USER_AGENT: &str = "USER-AGENT";
}

/// Valeurs du header NTS
pub mod nts {
    pub const ALIVE: &str = "ssdp:alive";
    pub const BYEBYE: &str = "ssdp:byebye";
}

/// Type d'un message SSDP, déterminé par sa start-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpMessageKind {
    /// `NOTIFY * HTTP/1.1`
    NotifyRequest,
    /// `M-SEARCH * HTTP/1.1`
    SearchRequest,
    /// `HTTP/1.1 200 OK`
    SearchResponse,
}

impl SsdpMessageKind {
    /// Start-line émise pour ce type de message.
    pub fn start_line(&self) -> &'static str {
        match self {
            SsdpMessageKind::NotifyRequest => "NOTIFY * HTTP/1.1",
            SsdpMessageKind::SearchRequest => "M-SEARCH * HTTP/1.1",
            SsdpMessageKind::SearchResponse => "HTTP/1.1 200 OK",
        }
    }

    /// Vrai pour les messages côté requête (NOTIFY et M-SEARCH).
    pub fn is_request(&self) -> bool {
        !matches!(self, SsdpMessageKind::SearchResponse)
    }
}

/// Message SSDP : start-line typée + headers ordonnés.
///
/// L'ordre d'insertion des headers est conservé à l'émission. La casse des
/// noms est conservée telle que fournie ; les recherches sont insensibles à
/// la casse.
#[derive(Debug, Clone)]
pub struct SsdpMessage {
    kind: SsdpMessageKind,
    headers: Vec<(String, String)>,
}

impl SsdpMessage {
    pub fn new(kind: SsdpMessageKind) -> Self {
        Self {
            kind,
            headers: Vec::new(),
        }
    }

    pub fn kind(&self) -> SsdpMessageKind {
        self.kind
    }

    /// Ajoute un header (style builder).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Remplace le header s'il existe déjà, sinon l'ajoute en fin.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (n, v) in &mut self.headers {
            if n.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    /// Valeur du premier header portant ce nom (insensible à la casse).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Tous les headers, dans l'ordre d'insertion.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Durée extraite de `CACHE-CONTROL: max-age = N`, si présente et lisible.
    pub fn max_age(&self) -> Option<u64> {
        parse_max_age(self.header(headers::CACHE_CONTROL)?)
    }

    /// Sérialise le message en datagramme HTTPU.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(128 + self.headers.len() * 32);
        out.push_str(self.kind.start_line());
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            if !value.is_empty() {
                out.push(' ');
                out.push_str(value);
            }
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Parse un datagramme entrant. `None` si la start-line n'est pas l'une
    /// des trois formes reconnues (le datagramme est alors ignoré).
    pub fn parse(data: &[u8]) -> Option<Self> {
        parse::parse_message(data)
    }
}
