//! Format model: format identities and the payload they describe.
//!
//! A [`DataFormat`] is a canonical name plus synonyms. Each backend
//! speaks its own vocabulary (X11 target atoms, Wayland mime types, COM
//! clipboard format ids); matching a format against a peer's raw format
//! string is a case-sensitive prefix match against any of the names.

pub mod data;
pub mod uri;

use std::fmt;

use crate::error::ExchangeError;

pub use data::{ExchangeData, ImageBuffer, unwrap, wrap};
pub use uri::{decode_uri_list, encode_uri_list};

/// Canonical name of the UTF-8 text format.
pub const MIME_TEXT_UTF8: &str = "text/plain;charset=utf-8";
/// Unqualified plain text.
pub const MIME_TEXT: &str = "text/plain";
/// RFC 2483 URI list.
pub const MIME_URI_LIST: &str = "text/uri-list";
/// Internal raw RGBA image format.
pub const MIME_IMAGE: &str = "image/x-xfer-rgba";
/// Fallback for anything unrecognized.
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// What kind of payload a format carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Text,
    UriList,
    Image,
    Bytes,
}

/// A format identity: a canonical name and its synonyms.
///
/// Two formats are equal if any name of one equals any name of the
/// other. An empty name denotes "no format".
#[derive(Debug, Clone)]
pub struct DataFormat {
    name: String,
    synonyms: Vec<String>,
}

impl DataFormat {
    /// Create a format with synonyms. Rejects an empty primary name.
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        synonyms: impl IntoIterator<Item = S>,
    ) -> Result<Self, ExchangeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ExchangeError::InvalidFormat("empty format name".into()));
        }
        Ok(Self {
            name,
            synonyms: synonyms
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        })
    }

    /// A format known only by the peer's raw name. Carries raw bytes.
    /// An empty `name` yields [`DataFormat::none`].
    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            synonyms: Vec::new(),
        }
    }

    /// The invalid "no format" marker.
    pub fn none() -> Self {
        Self {
            name: String::new(),
            synonyms: Vec::new(),
        }
    }

    /// UTF-8 text.
    pub fn text() -> Self {
        Self {
            name: MIME_TEXT_UTF8.into(),
            synonyms: vec![
                MIME_TEXT.into(),
                "UTF8_STRING".into(),
                "STRING".into(),
                "TEXT".into(),
            ],
        }
    }

    /// A list of URIs.
    pub fn uri_list() -> Self {
        Self {
            name: MIME_URI_LIST.into(),
            synonyms: Vec::new(),
        }
    }

    /// Internal image format (raw RGBA8).
    pub fn image() -> Self {
        Self {
            name: MIME_IMAGE.into(),
            synonyms: Vec::new(),
        }
    }

    /// Opaque bytes.
    pub fn octet_stream() -> Self {
        Self {
            name: MIME_OCTET_STREAM.into(),
            synonyms: Vec::new(),
        }
    }

    /// Canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn synonyms(&self) -> &[String] {
        &self.synonyms
    }

    /// Primary name followed by synonyms, in preference order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.synonyms.iter().map(String::as_str))
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    /// Whether the peer's raw protocol-format string names this format.
    pub fn matches(&self, raw: &str) -> bool {
        self.is_valid() && !raw.is_empty() && self.names().any(|n| raw.starts_with(n))
    }

    /// Payload kind this format carries.
    pub fn kind(&self) -> FormatKind {
        if *self == DataFormat::text() {
            FormatKind::Text
        } else if *self == DataFormat::uri_list() {
            FormatKind::UriList
        } else if *self == DataFormat::image() {
            FormatKind::Image
        } else {
            FormatKind::Bytes
        }
    }
}

impl PartialEq for DataFormat {
    fn eq(&self, other: &Self) -> bool {
        if !self.is_valid() || !other.is_valid() {
            return !self.is_valid() && !other.is_valid();
        }
        self.names().any(|a| other.names().any(|b| a == b))
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str(&self.name)
        } else {
            f.write_str("<none>")
        }
    }
}

/// The standard formats, in preference order.
pub fn standard_formats() -> [DataFormat; 4] {
    [
        DataFormat::text(),
        DataFormat::uri_list(),
        DataFormat::image(),
        DataFormat::octet_stream(),
    ]
}

/// Map a peer's raw format string onto a standard format, or a custom
/// format carrying the raw name.
pub fn standard_for(raw: &str) -> DataFormat {
    standard_formats()
        .into_iter()
        .find(|f| f.matches(raw))
        .unwrap_or_else(|| DataFormat::custom(raw))
}

/// Map a peer's raw format list onto formats, collapsing synonyms so
/// each standard format appears once.
pub fn formats_from_raw<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<DataFormat> {
    let mut out: Vec<DataFormat> = Vec::new();
    for name in raw {
        if name.is_empty() {
            continue;
        }
        let format = standard_for(name);
        if !out.contains(&format) {
            out.push(format);
        }
    }
    out
}

/// Find the first raw name in `offered` that `format` matches.
pub fn pick_raw<'a>(format: &DataFormat, offered: &'a [String]) -> Option<&'a str> {
    // Prefer exact name hits in the format's own preference order.
    for name in format.names() {
        if let Some(hit) = offered.iter().find(|o| o.as_str() == name) {
            return Some(hit.as_str());
        }
    }
    offered
        .iter()
        .find(|o| format.matches(o))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_reflexive_and_symmetric() {
        let text = DataFormat::text();
        let plain = DataFormat::custom("text/plain");
        assert_eq!(text, text);
        assert_eq!(text, plain);
        assert_eq!(plain, text);
        assert_ne!(text, DataFormat::uri_list());
    }

    #[test]
    fn equality_matches_synonyms() {
        let utf8 = DataFormat::custom("UTF8_STRING");
        assert_eq!(DataFormat::text(), utf8);
    }

    #[test]
    fn text_matches_charset_mime() {
        assert!(DataFormat::text().matches("text/plain;charset=utf-8"));
        assert!(DataFormat::text().matches("text/plain;charset=UTF-8"));
        assert!(!DataFormat::text().matches("text/html"));
    }

    #[test]
    fn match_is_case_sensitive() {
        assert!(!DataFormat::uri_list().matches("TEXT/URI-LIST"));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(DataFormat::new("", Vec::<String>::new()).is_err());
        assert!(!DataFormat::none().is_valid());
        assert!(!DataFormat::none().matches("text/plain"));
        assert!(!DataFormat::text().matches(""));
    }

    #[test]
    fn none_equals_only_none() {
        assert_eq!(DataFormat::none(), DataFormat::custom(""));
        assert_ne!(DataFormat::none(), DataFormat::text());
    }

    #[test]
    fn kinds() {
        assert_eq!(DataFormat::text().kind(), FormatKind::Text);
        assert_eq!(DataFormat::custom("STRING").kind(), FormatKind::Text);
        assert_eq!(DataFormat::uri_list().kind(), FormatKind::UriList);
        assert_eq!(DataFormat::image().kind(), FormatKind::Image);
        assert_eq!(DataFormat::custom("image/png").kind(), FormatKind::Bytes);
    }

    #[test]
    fn raw_list_collapses_synonyms() {
        let formats = formats_from_raw([
            "TARGETS",
            "UTF8_STRING",
            "text/plain;charset=utf-8",
            "STRING",
            "text/uri-list",
            "image/png",
        ]);
        assert_eq!(formats.len(), 4);
        assert_eq!(formats[0], DataFormat::custom("TARGETS"));
        assert_eq!(formats[1], DataFormat::text());
        assert_eq!(formats[2], DataFormat::uri_list());
        assert_eq!(formats[3].name(), "image/png");
    }

    #[test]
    fn pick_raw_prefers_canonical_name() {
        let offered: Vec<String> = ["STRING", "UTF8_STRING", "text/plain;charset=utf-8"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            pick_raw(&DataFormat::text(), &offered),
            Some("text/plain;charset=utf-8")
        );
        assert_eq!(pick_raw(&DataFormat::uri_list(), &offered), None);
    }
}
