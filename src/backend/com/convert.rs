//! Conversion between [`ExchangeData`] and clipboard-format bytes.
//!
//! | Format          | Clipboard id     | Layout                                   |
//! |-----------------|------------------|------------------------------------------|
//! | text            | `CF_UNICODETEXT` | UTF-16LE, NUL-terminated                 |
//! | text            | `CF_TEXT`        | 8-bit, NUL-terminated                    |
//! | uri list        | `CF_HDROP`       | `DROPFILES` header, wide path list       |
//! | image           | `CF_DIB`         | `BITMAPINFOHEADER`, 32-bpp bottom-up BGRA |
//! | anything else   | registered id    | raw bytes                                |

use bytes::{Buf, BufMut, BytesMut};

use super::types::{CF_DIB, CF_HDROP, CF_TEXT, CF_UNICODETEXT, ClipFormat};
use crate::format::uri::file_uri_to_path;
use crate::format::{DataFormat, ExchangeData, ImageBuffer, unwrap, wrap};

/// Size of `DROPFILES`.
const DROPFILES_LEN: usize = 20;
/// Size of `BITMAPINFOHEADER`.
const BITMAPINFOHEADER_LEN: usize = 40;
const BI_RGB: u32 = 0;
const BI_BITFIELDS: u32 = 3;

/// Bytes for `cf`, or `None` if `data` cannot be expressed in it.
pub fn encode(data: &ExchangeData, format: &DataFormat, cf: ClipFormat) -> Option<Vec<u8>> {
    match (cf, data) {
        (CF_UNICODETEXT, ExchangeData::Text(text)) => Some(text_to_unicode(text)),
        (CF_TEXT, ExchangeData::Text(text)) => Some(text_to_ansi(text)),
        (CF_HDROP, ExchangeData::UriList(uris)) => uri_list_to_hdrop(uris),
        (CF_DIB, ExchangeData::Image(image)) => Some(image_to_dib(image)),
        (CF_UNICODETEXT | CF_TEXT | CF_HDROP | CF_DIB, _) => None,
        _ => unwrap(data, format),
    }
}

/// Interpret bytes read for `cf`. Malformed input yields `Empty`.
pub fn decode(bytes: &[u8], format: &DataFormat, cf: ClipFormat) -> ExchangeData {
    let data = match cf {
        CF_UNICODETEXT => Some(ExchangeData::Text(unicode_to_text(bytes))),
        CF_TEXT => Some(ExchangeData::Text(ansi_to_text(bytes))),
        CF_HDROP => hdrop_to_uri_list(bytes).map(ExchangeData::UriList),
        CF_DIB => dib_to_image(bytes).map(ExchangeData::Image),
        _ => return wrap(bytes, format),
    };
    data.unwrap_or_default()
}

pub fn text_to_unicode(text: &str) -> Vec<u8> {
    let mut out = BytesMut::with_capacity((text.len() + 1) * 2);
    for unit in text.encode_utf16() {
        out.put_u16_le(unit);
    }
    out.put_u16_le(0);
    out.to_vec()
}

/// Stops at the first NUL; unpaired surrogates become U+FFFD.
pub fn unicode_to_text(mut bytes: &[u8]) -> String {
    let mut units = Vec::with_capacity(bytes.len() / 2);
    while bytes.remaining() >= 2 {
        let unit = bytes.get_u16_le();
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16_lossy(&units)
}

/// Latin-1 where possible, `?` otherwise.
pub fn text_to_ansi(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect();
    out.push(0);
    out
}

pub fn ansi_to_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

/// `DROPFILES` for the local files in `uris`; other schemes are skipped.
/// `None` if nothing is left.
pub fn uri_list_to_hdrop(uris: &[String]) -> Option<Vec<u8>> {
    let paths: Vec<String> = uris.iter().filter_map(|uri| uri_to_native_path(uri)).collect();
    if paths.is_empty() {
        return None;
    }

    let mut out = BytesMut::with_capacity(DROPFILES_LEN + 64 * paths.len());
    out.put_u32_le(DROPFILES_LEN as u32); // pFiles
    out.put_i32_le(0); // pt.x
    out.put_i32_le(0); // pt.y
    out.put_u32_le(0); // fNC
    out.put_u32_le(1); // fWide
    for path in &paths {
        for unit in path.encode_utf16() {
            out.put_u16_le(unit);
        }
        out.put_u16_le(0);
    }
    out.put_u16_le(0);
    Some(out.to_vec())
}

pub fn hdrop_to_uri_list(bytes: &[u8]) -> Option<Vec<String>> {
    if bytes.len() < DROPFILES_LEN {
        return None;
    }
    let mut header = &bytes[..DROPFILES_LEN];
    let files = header.get_u32_le() as usize;
    header.advance(12);
    let wide = header.get_u32_le() != 0;
    let mut list = bytes.get(files..)?;

    let mut uris = Vec::new();
    if wide {
        loop {
            let mut units = Vec::new();
            while list.remaining() >= 2 {
                let unit = list.get_u16_le();
                if unit == 0 {
                    break;
                }
                units.push(unit);
            }
            if units.is_empty() {
                break;
            }
            uris.push(native_path_to_uri(&String::from_utf16_lossy(&units)));
        }
    } else {
        for name in list.split(|&b| b == 0) {
            if name.is_empty() {
                break;
            }
            uris.push(native_path_to_uri(&String::from_utf8_lossy(name)));
        }
    }
    Some(uris)
}

/// `C:\dir\f` for `file:///C:/dir/f`; POSIX paths pass through.
fn uri_to_native_path(uri: &str) -> Option<String> {
    let path = file_uri_to_path(uri)?;
    let path = path.to_string_lossy();
    let drive = path.as_bytes();
    if drive.len() >= 3 && drive[0] == b'/' && drive[1].is_ascii_alphabetic() && drive[2] == b':' {
        Some(path[1..].replace('/', "\\"))
    } else {
        Some(path.into_owned())
    }
}

fn native_path_to_uri(path: &str) -> String {
    let path = path.replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{path}")
    }
}

/// `BITMAPINFOHEADER` plus bottom-up BGRA rows.
pub fn image_to_dib(image: &ImageBuffer) -> Vec<u8> {
    let row = image.width as usize * 4;
    let mut out = BytesMut::with_capacity(BITMAPINFOHEADER_LEN + image.pixels.len());
    out.put_u32_le(BITMAPINFOHEADER_LEN as u32); // biSize
    out.put_i32_le(image.width as i32);
    out.put_i32_le(image.height as i32); // positive: bottom-up
    out.put_u16_le(1); // biPlanes
    out.put_u16_le(32); // biBitCount
    out.put_u32_le(BI_RGB);
    out.put_u32_le(image.pixels.len() as u32); // biSizeImage
    out.put_i32_le(0);
    out.put_i32_le(0);
    out.put_u32_le(0);
    out.put_u32_le(0);
    if row > 0 {
        for line in image.pixels.chunks_exact(row).rev() {
            for px in line.chunks_exact(4) {
                out.put_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
    }
    out.to_vec()
}

/// Reads 24- and 32-bpp uncompressed bitmaps in either row order. A
/// 32-bpp image whose alpha is zero throughout is taken as opaque.
pub fn dib_to_image(bytes: &[u8]) -> Option<ImageBuffer> {
    if bytes.len() < BITMAPINFOHEADER_LEN {
        return None;
    }
    let mut header = bytes;
    let header_len = header.get_u32_le() as usize;
    let width = header.get_i32_le();
    let height = header.get_i32_le();
    header.advance(2);
    let bit_count = header.get_u16_le();
    let compression = header.get_u32_le();
    if header_len < BITMAPINFOHEADER_LEN || width < 0 {
        return None;
    }

    let mut offset = header_len;
    match (bit_count, compression) {
        (24, BI_RGB) | (32, BI_RGB) => {}
        // Channel masks follow a plain 40-byte header.
        (32, BI_BITFIELDS) if header_len == BITMAPINFOHEADER_LEN => offset += 12,
        (32, BI_BITFIELDS) => {}
        _ => return None,
    }

    let width = width as usize;
    let rows = height.unsigned_abs() as usize;
    let bytes_pp = usize::from(bit_count / 8);
    let stride = (width * bytes_pp).div_ceil(4) * 4;
    let pixels = bytes.get(offset..)?;
    if pixels.len() < stride.checked_mul(rows)? {
        return None;
    }

    let mut out = Vec::with_capacity(width * rows * 4);
    for y in 0..rows {
        // Positive height is stored bottom-up.
        let src = if height > 0 { rows - 1 - y } else { y };
        let line = &pixels[src * stride..src * stride + width * bytes_pp];
        for px in line.chunks_exact(bytes_pp) {
            let alpha = if bytes_pp == 4 { px[3] } else { 0xFF };
            out.extend_from_slice(&[px[2], px[1], px[0], alpha]);
        }
    }
    if bytes_pp == 4 && out.chunks_exact(4).all(|px| px[3] == 0) {
        for px in out.chunks_exact_mut(4) {
            px[3] = 0xFF;
        }
    }
    ImageBuffer::new(width as u32, rows as u32, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::com::types::CF_REGISTERED_FIRST;

    // -- Text --

    #[test]
    fn unicode_text_is_nul_terminated_utf16() {
        let bytes = text_to_unicode("hé");
        assert_eq!(bytes, vec![b'h', 0, 0xE9, 0, 0, 0]);
        assert_eq!(unicode_to_text(&bytes), "hé");
    }

    #[test]
    fn unicode_text_stops_at_nul_and_tolerates_odd_length() {
        assert_eq!(unicode_to_text(&[b'a', 0, 0, 0, b'b', 0]), "a");
        assert_eq!(unicode_to_text(&[b'a', 0, b'b']), "a");
        assert_eq!(unicode_to_text(&text_to_unicode("😀")), "😀");
    }

    #[test]
    fn ansi_text_replaces_wide_characters() {
        assert_eq!(text_to_ansi("aé€"), vec![b'a', 0xE9, b'?', 0]);
        assert_eq!(ansi_to_text(&[b'a', 0xE9, 0, b'z']), "aé");
    }

    // -- CF_HDROP --

    #[test]
    fn hdrop_header_and_paths() {
        let bytes = uri_list_to_hdrop(&["file:///tmp/a b.txt".into()]).unwrap();
        assert_eq!(&bytes[..4], &20u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
        let path: Vec<u8> = "/tmp/a b.txt"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        assert_eq!(&bytes[20..20 + path.len()], path.as_slice());
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);
        assert_eq!(
            hdrop_to_uri_list(&bytes).unwrap(),
            vec!["file:///tmp/a b.txt".to_string()]
        );
    }

    #[test]
    fn hdrop_drive_letter_paths() {
        let uris = vec!["file:///C:/Users/me/notes.txt".to_string()];
        let bytes = uri_list_to_hdrop(&uris).unwrap();
        let wide: Vec<u8> = "C:\\Users\\me\\notes.txt"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        assert_eq!(&bytes[20..20 + wide.len()], wide.as_slice());
        assert_eq!(hdrop_to_uri_list(&bytes).unwrap(), uris);
    }

    #[test]
    fn hdrop_skips_remote_uris() {
        assert_eq!(uri_list_to_hdrop(&["https://example.com/x".into()]), None);
        let bytes = uri_list_to_hdrop(&[
            "https://example.com/x".into(),
            "file://localhost/srv/y".into(),
        ])
        .unwrap();
        assert_eq!(
            hdrop_to_uri_list(&bytes).unwrap(),
            vec!["file:///srv/y".to_string()]
        );
    }

    #[test]
    fn hdrop_reads_ansi_lists() {
        let mut bytes = vec![0u8; 20];
        bytes[0] = 20;
        bytes.extend_from_slice(b"/a\0/b\0\0");
        assert_eq!(
            hdrop_to_uri_list(&bytes).unwrap(),
            vec!["file:///a".to_string(), "file:///b".to_string()]
        );
        assert_eq!(hdrop_to_uri_list(&bytes[..10]), None);
    }

    // -- CF_DIB --

    #[test]
    fn dib_is_bottom_up_bgra() {
        // Top row red, bottom row blue.
        let image = ImageBuffer::new(1, 2, vec![255, 0, 0, 255, 0, 0, 255, 128]).unwrap();
        let dib = image_to_dib(&image);
        assert_eq!(dib.len(), 40 + 8);
        assert_eq!(&dib[..4], &40u32.to_le_bytes());
        assert_eq!(&dib[8..12], &2i32.to_le_bytes());
        assert_eq!(&dib[14..16], &32u16.to_le_bytes());
        assert_eq!(&dib[40..44], &[255, 0, 0, 128]);
        assert_eq!(&dib[44..48], &[0, 0, 255, 255]);
        assert_eq!(dib_to_image(&dib), Some(image));
    }

    #[test]
    fn dib_24_bit_rows_are_padded() {
        let mut dib = vec![0u8; 40];
        dib[..4].copy_from_slice(&40u32.to_le_bytes());
        dib[4..8].copy_from_slice(&1i32.to_le_bytes());
        dib[8..12].copy_from_slice(&(-1i32).to_le_bytes());
        dib[14..16].copy_from_slice(&24u16.to_le_bytes());
        dib.extend_from_slice(&[10, 20, 30, 0]);
        let image = dib_to_image(&dib).unwrap();
        assert_eq!(image.pixels, vec![30, 20, 10, 255]);
    }

    #[test]
    fn dib_without_alpha_is_opaque() {
        let image = ImageBuffer::new(1, 1, vec![1, 2, 3, 0]).unwrap();
        let decoded = dib_to_image(&image_to_dib(&image)).unwrap();
        assert_eq!(decoded.pixels, vec![1, 2, 3, 255]);
    }

    #[test]
    fn truncated_dib_is_rejected() {
        let image = ImageBuffer::new(2, 2, vec![0; 16]).unwrap();
        let dib = image_to_dib(&image);
        assert_eq!(dib_to_image(&dib[..dib.len() - 1]), None);
        assert_eq!(dib_to_image(&dib[..20]), None);
    }

    // -- Dispatch --

    #[test]
    fn encode_checks_the_variant() {
        let text = ExchangeData::Text("x".into());
        assert_eq!(encode(&text, &DataFormat::text(), CF_DIB), None);
        assert_eq!(
            decode(&encode(&text, &DataFormat::text(), CF_TEXT).unwrap(), &DataFormat::text(), CF_TEXT),
            text
        );
    }

    #[test]
    fn registered_formats_carry_raw_bytes() {
        let html = DataFormat::custom("text/html");
        let data = ExchangeData::Bytes(b"<b>x</b>".to_vec());
        let bytes = encode(&data, &html, CF_REGISTERED_FIRST).unwrap();
        assert_eq!(bytes, b"<b>x</b>");
        assert_eq!(decode(&bytes, &html, CF_REGISTERED_FIRST), data);
    }

    #[test]
    fn malformed_payload_decodes_empty() {
        assert_eq!(
            decode(&[1, 2, 3], &DataFormat::image(), CF_DIB),
            ExchangeData::Empty
        );
    }
}
