use tracing::{info, warn};

/// Last resort when the capture device supports none of the configured formats.
pub const GENERIC_FALLBACK_FORMAT: &str = "video/webm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub mime_type: String,
    pub fallback: bool,
}

impl NegotiatedFormat {
    /// File extension of the container carried by this MIME type.
    pub fn extension(&self) -> &'static str {
        container_extension(&self.mime_type)
    }
}

pub fn container_extension(mime_type: &str) -> &'static str {
    let base = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "video/webm" | "audio/webm" => "webm",
        "video/mp4" | "audio/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        _ => "bin",
    }
}

/// Picks the first supported format from a descending preference list. Never
/// fails: when nothing matches, the configured fallback (or the generic
/// default) is returned and flagged.
pub fn negotiate<F>(preferred: &[String], fallback: &str, supports: F) -> NegotiatedFormat
where
    F: Fn(&str) -> bool,
{
    if let Some(found) = preferred.iter().find(|candidate| supports(candidate)) {
        info!(format = %found, "negotiated recording format");
        return NegotiatedFormat {
            mime_type: found.clone(),
            fallback: false,
        };
    }
    let mime_type = if fallback.trim().is_empty() {
        GENERIC_FALLBACK_FORMAT.to_string()
    } else {
        fallback.to_string()
    };
    warn!(format = %mime_type, "no preferred recording format supported; using fallback");
    NegotiatedFormat {
        mime_type,
        fallback: true,
    }
}
