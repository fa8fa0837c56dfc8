use anyhow::{Result, anyhow};

/// Canonical ASCII, lower-case form of a hostname. A leading `*.` is kept so
/// wildcard names survive normalization.
pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    let (wildcard, bare) = match trimmed.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if bare.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let ascii =
        idna::domain_to_ascii(bare).map_err(|err| anyhow!("invalid domain name: {err}"))?;
    if ascii.contains('*') {
        return Err(anyhow!("wildcard is only allowed as the leftmost label"));
    }
    let ascii = ascii.to_lowercase();
    Ok(if wildcard { format!("*.{ascii}") } else { ascii })
}

/// The name ACME validates for a domain: wildcards are authorized on their base.
pub fn authorization_name(domain: &str) -> &str {
    let trimmed = domain.trim_end_matches('.');
    trimmed.strip_prefix("*.").unwrap_or(trimmed)
}

pub fn normalize_domain_for_display(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('.');
    let (unicode, _) = idna::domain_to_unicode(trimmed);
    unicode.to_lowercase()
}
