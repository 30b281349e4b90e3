//! Credential masking for log output and traced URIs
//!
//! Secrets keep their first and last two characters so operators can tell
//! tokens apart without the log revealing them.

use std::borrow::Cow;
use std::io;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Query parameters whose values are masked in traced URIs
const SENSITIVE_PARAMS: &[&str] = &[
    "token",
    "access_token",
    "api_key",
    "apikey",
    "secret",
    "password",
];

/// Mask a secret value, keeping the first and last two characters
#[must_use]
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => String::new(),
        1..=4 => "***".to_string(),
        n => {
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[n - 2..].iter().collect();
            format!("{head}***{tail}")
        }
    }
}

/// Mask sensitive query parameter values in a request URI.
///
/// Returns the input unchanged when there is nothing to mask.
#[must_use]
pub fn redact_uri(uri: &str) -> Cow<'_, str> {
    let Some((path, query)) = uri.split_once('?') else {
        return Cow::Borrowed(uri);
    };

    let mut changed = false;
    let pairs: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if is_sensitive_param(key) && !value.is_empty() => {
                changed = true;
                format!("{key}={}", mask_value(value))
            }
            _ => pair.to_string(),
        })
        .collect();

    if changed {
        Cow::Owned(format!("{path}?{}", pairs.join("&")))
    } else {
        Cow::Borrowed(uri)
    }
}

fn is_sensitive_param(key: &str) -> bool {
    SENSITIVE_PARAMS.iter().any(|p| p.eq_ignore_ascii_case(key))
}

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)("(?:token|bearer_token|api[-_]?key|secret|password)"\s*:\s*")([^"]+)"#,
            r"(?i)(\b(?:token|access_token|api[-_]?key|secret|password)=)([^\s&]+)",
            concat!(
                r"(?i)(\b(?:authorization|x-api-key)\s*[:=]\s*(?:bearer\s+|basic\s+)?)",
                r"([A-Za-z0-9+/=._~-]+)",
            ),
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Mask credentials appearing anywhere in free text
#[must_use]
pub fn mask_sensitive(input: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(input);
    for re in patterns() {
        if re.is_match(&out) {
            let replaced = re
                .replace_all(&out, |caps: &Captures<'_>| {
                    format!("{}{}", &caps[1], mask_value(&caps[2]))
                })
                .into_owned();
            out = Cow::Owned(replaced);
        }
    }
    out
}

/// Writer that masks credentials before forwarding to the inner writer.
///
/// Used as the `tracing_subscriber` output so every formatted event is
/// scrubbed.
#[derive(Debug)]
pub struct MaskingWriter<W> {
    inner: W,
}

impl<W> MaskingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: io::Write> io::Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(mask_sensitive(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
