/// Source routing and output naming for incoming URLs.
///
/// Known streaming hosts go through the extraction service; everything else
/// is treated as a direct file and fetched with the segmented downloader.
use regex::Regex;
use once_cell::sync::Lazy;

/// Fallback file name when a URL has no usable last path segment.
pub const DEFAULT_FILE_NAME: &str = "download.bin";

/// How a URL should be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Streaming page that needs the extraction service.
    Extractable { url: String, host: String },
    /// Plain file served over HTTP(S).
    Direct { url: String, file_name: String },
}

impl SourceKind {
    /// Get the URL regardless of type.
    pub fn url(&self) -> &str {
        match self {
            SourceKind::Extractable { url, .. } => url,
            SourceKind::Direct { url, .. } => url,
        }
    }

    pub fn is_extractable(&self) -> bool {
        matches!(self, SourceKind::Extractable { .. })
    }
}

// ====== REGEX PATTERNS ======

/// http/https URL with a capturable host.
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^https?://(?:[^@/\s]+@)?([^/:?#\s]+)(?::\d+)?([^\s]*)$"#
    ).unwrap()
});

/// Hosts whose pages need the extraction service.
static STREAMING_HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|\.)(?:youtube\.com|youtu\.be|youtube-nocookie\.com|vimeo\.com|dailymotion\.com|twitch\.tv|tiktok\.com|instagram\.com|facebook\.com|fb\.watch|twitter\.com|x\.com|reddit\.com|soundcloud\.com|bilibili\.com)$"
    ).unwrap()
});

/// Characters kept verbatim in a sanitized title.
static UNSAFE_TITLE_CHARS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^A-Za-z0-9_.\-]").unwrap()
});

/// Classify a URL. Returns None if it is not an http(s) URL.
pub fn classify(url: &str) -> Option<SourceKind> {
    let url = url.trim();
    let caps = URL_RE.captures(url)?;
    let host = caps[1].to_ascii_lowercase();

    if STREAMING_HOST_RE.is_match(&host) {
        return Some(SourceKind::Extractable {
            url: url.to_string(),
            host,
        });
    }

    Some(SourceKind::Direct {
        url: url.to_string(),
        file_name: file_name_from_url(url),
    })
}

/// Last path segment of a URL, without query or fragment.
///
/// Path separators and control characters never survive; an empty result
/// falls back to [`DEFAULT_FILE_NAME`].
pub fn file_name_from_url(url: &str) -> String {
    let path = URL_RE
        .captures(url.trim())
        .and_then(|c| c.get(2).map(|m| m.as_str()))
        .unwrap_or("");
    let path = path.split(['?', '#']).next().unwrap_or("");
    let segment = path.rsplit('/').next().unwrap_or("");

    let cleaned: String = segment
        .chars()
        .filter(|c| !c.is_control() && *c != '\\')
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');

    if cleaned.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_title(title: &str) -> String {
    let sanitized = UNSAFE_TITLE_CHARS_RE.replace_all(title.trim(), "_").into_owned();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "untitled".to_string()
    } else {
        sanitized
    }
}

/// `movie.mkv` -> `movie_Compressed.mp4`.
pub fn compressed_name(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    format!("{}_Compressed.mp4", stem)
}
