//! Exchange payloads and their byte serialization.
//!
//! [`wrap`] turns raw bytes received for a format into the matching
//! [`ExchangeData`] variant; [`unwrap`] goes the other way. For every
//! standard format `unwrap(&wrap(bytes, f), f) == bytes` on well-formed
//! input; unrecognized formats pass through as raw bytes.

use super::uri::{decode_uri_list, encode_uri_list};
use super::{DataFormat, FormatKind};

/// Size of the serialized image header: width and height, u32 LE.
const IMAGE_HEADER_LEN: usize = 8;

/// An owned RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    /// Row-major, top-down, 4 bytes per pixel.
    pub pixels: Vec<u8>,
}

impl ImageBuffer {
    /// Returns `None` if `pixels` does not hold exactly `width * height`
    /// RGBA pixels.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IMAGE_HEADER_LEN + self.pixels.len());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.pixels);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IMAGE_HEADER_LEN {
            return None;
        }
        let width = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let height = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self::new(width, height, bytes[IMAGE_HEADER_LEN..].to_vec())
    }
}

/// A payload for one format.
///
/// `Empty` is the failure value: a producer that cannot supply a format
/// returns it, and every failed retrieval resolves to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeData {
    #[default]
    Empty,
    Text(String),
    UriList(Vec<String>),
    Image(ImageBuffer),
    Bytes(Vec<u8>),
}

impl ExchangeData {
    pub fn is_empty(&self) -> bool {
        matches!(self, ExchangeData::Empty)
    }

    /// Whether the active variant is the one `format` calls for.
    pub fn matches_format(&self, format: &DataFormat) -> bool {
        matches!(
            (self, format.kind()),
            (ExchangeData::Text(_), FormatKind::Text)
                | (ExchangeData::UriList(_), FormatKind::UriList)
                | (ExchangeData::Image(_), FormatKind::Image)
                | (ExchangeData::Bytes(_), FormatKind::Bytes)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ExchangeData::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uri_list(&self) -> Option<&[String]> {
        match self {
            ExchangeData::UriList(uris) => Some(uris),
            _ => None,
        }
    }

    /// Short variant name for logging.
    pub fn variant_name(&self) -> &'static str {
        match self {
            ExchangeData::Empty => "empty",
            ExchangeData::Text(_) => "text",
            ExchangeData::UriList(_) => "uri-list",
            ExchangeData::Image(_) => "image",
            ExchangeData::Bytes(_) => "bytes",
        }
    }
}

/// Interpret bytes received for `format`.
///
/// Returns `Empty` if the bytes cannot represent the format (a
/// truncated image header, for instance). Text is taken as-is, NULs
/// included; native terminators are stripped by the backend that reads
/// them.
pub fn wrap(bytes: &[u8], format: &DataFormat) -> ExchangeData {
    if !format.is_valid() {
        return ExchangeData::Empty;
    }
    match format.kind() {
        FormatKind::Text => ExchangeData::Text(String::from_utf8_lossy(bytes).into_owned()),
        FormatKind::UriList => {
            ExchangeData::UriList(decode_uri_list(&String::from_utf8_lossy(bytes), true))
        }
        FormatKind::Image => ImageBuffer::from_bytes(bytes)
            .map(ExchangeData::Image)
            .unwrap_or_default(),
        FormatKind::Bytes => ExchangeData::Bytes(bytes.to_vec()),
    }
}

/// Serialize `data` for `format`.
///
/// Returns `None` if the variant does not match the format; callers
/// treat that as a failed retrieval.
pub fn unwrap(data: &ExchangeData, format: &DataFormat) -> Option<Vec<u8>> {
    if !data.matches_format(format) {
        return None;
    }
    match data {
        ExchangeData::Empty => None,
        ExchangeData::Text(s) => Some(s.as_bytes().to_vec()),
        ExchangeData::UriList(uris) => Some(encode_uri_list(uris).into_bytes()),
        ExchangeData::Image(image) => Some(image.to_bytes()),
        ExchangeData::Bytes(bytes) => Some(bytes.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        let bytes = "héllo wörld".as_bytes();
        let data = wrap(bytes, &DataFormat::text());
        assert_eq!(data, ExchangeData::Text("héllo wörld".into()));
        assert_eq!(unwrap(&data, &DataFormat::text()).unwrap(), bytes);
    }

    #[test]
    fn text_keeps_trailing_nul() {
        let bytes = b"abc\0";
        let data = wrap(bytes, &DataFormat::text());
        assert_eq!(data, ExchangeData::Text("abc\0".into()));
        assert_eq!(unwrap(&data, &DataFormat::text()).unwrap(), bytes);
    }

    #[test]
    fn uri_list_round_trip() {
        let bytes = b"file:///tmp/a%20b\r\nfile:///tmp/c\r\n";
        let data = wrap(bytes, &DataFormat::uri_list());
        assert_eq!(
            data.as_uri_list().unwrap(),
            &["file:///tmp/a b".to_string(), "file:///tmp/c".to_string()]
        );
        assert_eq!(unwrap(&data, &DataFormat::uri_list()).unwrap(), bytes);
    }

    #[test]
    fn image_round_trip() {
        let image = ImageBuffer::new(2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let data = ExchangeData::Image(image);
        let bytes = unwrap(&data, &DataFormat::image()).unwrap();
        assert_eq!(&bytes[..8], &[2, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(wrap(&bytes, &DataFormat::image()), data);
    }

    #[test]
    fn truncated_image_is_empty() {
        assert!(wrap(&[2, 0, 0, 0, 2, 0, 0, 0, 1], &DataFormat::image()).is_empty());
        assert!(wrap(&[1, 2], &DataFormat::image()).is_empty());
        assert!(ImageBuffer::new(u32::MAX, u32::MAX, Vec::new()).is_none());
    }

    #[test]
    fn unknown_format_passes_bytes_through() {
        let format = DataFormat::custom("application/x-thing");
        let bytes = [0u8, 159, 146, 150];
        let data = wrap(&bytes, &format);
        assert_eq!(data, ExchangeData::Bytes(bytes.to_vec()));
        assert_eq!(unwrap(&data, &format).unwrap(), bytes);
    }

    #[test]
    fn mismatched_variant_does_not_unwrap() {
        let data = ExchangeData::Text("x".into());
        assert!(!data.matches_format(&DataFormat::uri_list()));
        assert_eq!(unwrap(&data, &DataFormat::uri_list()), None);
        assert_eq!(unwrap(&ExchangeData::Empty, &DataFormat::text()), None);
    }

    #[test]
    fn invalid_format_wraps_empty() {
        assert!(wrap(b"abc", &DataFormat::none()).is_empty());
    }
}
