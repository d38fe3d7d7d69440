//! Parsing tolérant des datagrammes HTTPU entrants.

use tracing::trace;

use super::{SsdpMessage, SsdpMessageKind};

/// Parse un datagramme. Les datagrammes malformés ou d'un type non reconnu
/// donnent `None` et sont simplement ignorés par l'appelant.
pub(super) fn parse_message(data: &[u8]) -> Option<SsdpMessage> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.lines();

    let first_line = lines.next()?.trim();
    let upper = first_line.to_ascii_uppercase();

    let kind = if upper.starts_with("HTTP/") {
        // Réponse : seul le statut 200 nous intéresse.
        if upper.contains(" 200 ") || upper.ends_with(" 200") {
            SsdpMessageKind::SearchResponse
        } else {
            trace!("Dropping non-200 HTTP response: {}", first_line);
            return None;
        }
    } else {
        let mut tokens = upper.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some("NOTIFY"), Some("*"), Some("HTTP/1.1"), None) => SsdpMessageKind::NotifyRequest,
            (Some("M-SEARCH"), Some("*"), Some("HTTP/1.1"), None) => SsdpMessageKind::SearchRequest,
            _ => {
                trace!("Dropping unrecognized SSDP start line: {}", first_line);
                return None;
            }
        }
    };

    let mut message = SsdpMessage::new(kind);
    for line in lines {
        let line = line.trim();

        // Ligne vide : fin des headers.
        if line.is_empty() {
            break;
        }

        // Découpe au premier ':' seulement, les valeurs peuvent en contenir.
        if let Some(colon_pos) = line.find(':') {
            let (name, value_with_colon) = line.split_at(colon_pos);
            let value = &value_with_colon[1..];

            let name = name.trim();
            if name.is_empty() {
                trace!("Skipping header with empty name: '{}'", line);
                continue;
            }
            message = message.with_header(name, value.trim().to_string());
        } else {
            trace!("Skipping line without colon: '{}'", line);
        }
    }

    Some(message)
}

/// Extrait la valeur de `max-age` d'un header `CACHE-CONTROL`.
///
/// Tolère `max-age=N`, `max-age = N` et les variantes de casse.
pub fn parse_max_age(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    let idx = lower.find("max-age")?;
    let after_key = &value[idx + "max-age".len()..];
    let after_eq = after_key.trim_start().trim_start_matches('=').trim_start();
    let digits: String = after_eq
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok()
}
