//! `text/uri-list` encoding (RFC 2483).
//!
//! Entries are percent-encoded, CRLF-separated and CRLF-terminated.
//! Decoding accepts bare LF as well, since plenty of peers send that.

use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Bytes left as-is: RFC 3986 unreserved plus the path and scheme
/// delimiters we need to keep URIs readable.
const URI_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/')
    .remove(b':')
    .remove(b'@');

const FILE_SCHEME: &str = "file://";

/// Encode a list of URIs (or paths) into a `text/uri-list` body.
///
/// Empty entries are skipped; they have no representation in the format,
/// so decoding gives back the list minus its empty entries.
pub fn encode_uri_list<S: AsRef<str>>(uris: &[S]) -> String {
    let mut out = String::new();
    for uri in uris {
        let uri = uri.as_ref();
        if uri.is_empty() {
            continue;
        }
        out.extend(utf8_percent_encode(uri, URI_KEEP));
        out.push_str("\r\n");
    }
    out
}

/// Decode a `text/uri-list` body.
///
/// With `remove_comments`, lines starting with `#` are dropped.
/// Empty lines are always dropped.
pub fn decode_uri_list(text: &str, remove_comments: bool) -> Vec<String> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .filter(|line| !(remove_comments && line.starts_with('#')))
        .map(|line| percent_decode_str(line).decode_utf8_lossy().into_owned())
        .collect()
}

/// `file://` URI for an absolute path.
pub fn path_to_file_uri(path: &Path) -> String {
    format!("{FILE_SCHEME}{}", path.to_string_lossy())
}

/// Local path named by a (decoded) `file://` URI.
///
/// Accepts `file:///p`, `file://localhost/p` and a bare absolute path.
/// Returns `None` for other schemes or remote hosts.
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    if uri.starts_with('/') {
        return Some(PathBuf::from(uri));
    }
    let rest = uri.strip_prefix(FILE_SCHEME)?;
    let slash = rest.find('/')?;
    let (host, path) = rest.split_at(slash);
    if !host.is_empty() && host != "localhost" {
        return None;
    }
    Some(PathBuf::from(path))
}
