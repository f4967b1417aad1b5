//! Secret redaction for diagnostics derived from child output.

use std::borrow::Cow;

/// The replacement text for redacted secrets.
const REDACTED: &str = "[REDACTED]";

/// Bytes of an unparsable frame that may appear in a log line.
pub const PREVIEW_BYTES: usize = 16;

/// Replaces known secret values in text before it is logged.
///
/// Built from the credential values injected into one child and dropped with
/// that child's stderr pump.
#[derive(Clone, Default)]
pub struct SecretRedactor {
    secrets: Vec<String>,
}

impl std::fmt::Debug for SecretRedactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRedactor")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl SecretRedactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a secret containing another is replaced whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Redact every known secret from `input`.
    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if !self.secrets.iter().any(|s| input.contains(s.as_str())) {
            return Cow::Borrowed(input);
        }
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        Cow::Owned(out)
    }

    /// Describe an unparsable payload by size and a short escaped prefix.
    ///
    /// Secrets are replaced across the whole payload before the prefix is
    /// cut, so a short frame consisting of a credential never shows it.
    pub fn preview(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let clean = self.redact(&text);
        let mut end = clean.len().min(PREVIEW_BYTES);
        while !clean.is_char_boundary(end) {
            end -= 1;
        }
        let prefix: String = clean[..end].chars().flat_map(char::escape_default).collect();
        if clean.len() > end {
            format!("{} bytes, prefix \"{prefix}...\"", bytes.len())
        } else {
            format!("{} bytes, prefix \"{prefix}\"", bytes.len())
        }
    }
}
