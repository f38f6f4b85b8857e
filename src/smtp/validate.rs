//! Pure lexical validation for HELO arguments and mail addresses.
//!
//! Nothing here touches the network; the session decides which reply a
//! failed check maps to. The rules are deliberately stricter than RFC 5321
//! syntax, since a sink server mostly meets senders that never read it.

use std::net::Ipv4Addr;

/// A mail address split at its single `@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local: String,
    pub domain: String,
}

impl Mailbox {
    /// The `local@domain` rendering recorded in envelopes and logs.
    pub fn address(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

/// Validates a mail address as given in MAIL FROM / RCPT TO.
///
/// Accepts an optional `<...>` wrapper. After unwrapping, the address must
/// contain no whitespace, exactly one `@`, a non-empty local part, and a
/// dotted domain with non-empty labels, none of which starts with `-`,
/// whose last label is at least two characters.
pub fn check_address(raw: &str) -> Option<Mailbox> {
    let trimmed = raw.trim();
    let unwrapped = match (trimmed.find('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        (None, None) => trimmed,
        _ => return None, // unmatched bracket
    };

    let address = super::protocol::collapse_whitespace(unwrapped);
    if address.is_empty() || address.contains(' ') {
        return None;
    }

    let mut parts = address.split('@');
    let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() => (local, domain),
        _ => return None,
    };

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return None;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels
        .iter()
        .any(|label| label.is_empty() || label.starts_with('-'))
    {
        return None;
    }
    if labels.last()?.len() < 2 {
        return None;
    }

    Some(Mailbox {
        local: local.to_string(),
        domain: domain.to_string(),
    })
}

/// Validates a HELO/EHLO argument.
///
/// The string must be non-empty, not start with `.` or `-`, contain at
/// least one dot, and stay within `[a-z0-9.\-_\[\]]` (case-insensitive).
/// A bracketed form must be a full `[IPv4]` literal; a bare name must pass
/// the address check as `postmaster@<name>`. Obvious self-references
/// (`localhost`, our own hostname, our listen address, loopback literals)
/// are rejected as spoofed.
pub fn check_helo(helo: &str, host_name: &str, listen_ip: &str) -> bool {
    if helo.is_empty() {
        return false;
    }

    let lower = helo.to_ascii_lowercase();
    if lower.starts_with('.') || lower.starts_with('-') {
        return false;
    }
    if !lower.contains('.') {
        return false;
    }
    if !lower
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_' | '[' | ']'))
    {
        return false;
    }

    if lower == "localhost" || lower == host_name.to_ascii_lowercase() || lower == listen_ip {
        return false;
    }
    if lower.starts_with("[127.") {
        return false;
    }

    if let Some(inner) = lower.strip_prefix('[') {
        // Bracketed form: the enclosed string must parse as an IPv4
        // literal. It is not cross-checked against the connecting IP.
        match inner.strip_suffix(']') {
            Some(literal) => literal.parse::<Ipv4Addr>().is_ok(),
            None => false,
        }
    } else {
        // Brackets are only legal as the address-literal wrapper.
        if lower.contains('[') || lower.contains(']') {
            return false;
        }
        check_address(&format!("postmaster@{lower}")).is_some()
    }
}

/// Whether `domain` is one we accept mail for. An empty allow-list
/// accepts every domain.
pub fn is_local_domain(domain: &str, local_domains: &[String]) -> bool {
    local_domains.is_empty()
        || local_domains
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(domain))
}

/// Whether `mailbox` is one we accept mail for. An empty allow-list
/// accepts every mailbox.
pub fn is_local_mailbox(mailbox: &Mailbox, local_mailboxes: &[String]) -> bool {
    if local_mailboxes.is_empty() {
        return true;
    }
    let address = mailbox.address();
    local_mailboxes
        .iter()
        .any(|entry| entry.eq_ignore_ascii_case(&address))
}
