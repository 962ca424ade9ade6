//! Parse incoming message bytes into a [`ParsedMessage`]

use mail_parser::MessageParser;
use postbox_storage::models::ParsedMessage;
use tracing::debug;

/// Parse `raw` once for a delivery.
///
/// Unparseable input still yields a message carrying the raw bytes; it just
/// has no headers to dedupe or index on.
pub fn parse_message(raw: &[u8], index_attachments: bool, digest: Option<&str>) -> ParsedMessage {
    let mut message = ParsedMessage {
        raw: raw.to_vec(),
        digest: digest.map(str::to_string),
        index_attachments,
        ..Default::default()
    };

    let Some(parsed) = MessageParser::default().parse(raw) else {
        debug!(size = raw.len(), "Message headers could not be parsed");
        return message;
    };

    message.message_id = parsed.message_id().map(|s| s.to_string());
    message.subject = parsed.subject().map(|s| s.to_string());
    message.from = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string());
    message.resent_message_id = parsed
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case("Resent-Message-ID"))
        .and_then(|h| h.value().as_text())
        .map(|s| s.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .filter(|s| !s.is_empty());
    if index_attachments {
        message.attachment_count = parsed.attachment_count();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\n\
Subject: Quarterly report\r\n\
Message-ID: <abc123@example.com>\r\n\
\r\n\
See attached.\r\n";

    #[test]
    fn test_parse_headers() {
        let msg = parse_message(RAW, true, Some("deadbeef"));
        assert_eq!(msg.message_id.as_deref(), Some("abc123@example.com"));
        assert_eq!(msg.subject.as_deref(), Some("Quarterly report"));
        assert_eq!(msg.from.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.digest.as_deref(), Some("deadbeef"));
        assert_eq!(msg.raw, RAW);
        assert!(msg.index_attachments);
        assert_eq!(msg.dedupe_id(), Some("abc123@example.com"));
    }

    #[test]
    fn test_resent_message_id_preferred_for_dedupe() {
        let raw = b"Message-ID: <orig@example.com>\r\n\
Resent-Message-ID: <again@example.com>\r\n\
Subject: fwd\r\n\
\r\n\
body\r\n";
        let msg = parse_message(raw, false, None);
        assert_eq!(msg.resent_message_id.as_deref(), Some("again@example.com"));
        assert_eq!(msg.dedupe_id(), Some("again@example.com"));
    }

    #[test]
    fn test_headerless_body_keeps_raw() {
        let msg = parse_message(b"\r\n", false, None);
        assert_eq!(msg.raw, b"\r\n");
        assert_eq!(msg.dedupe_id(), None);
    }
}
