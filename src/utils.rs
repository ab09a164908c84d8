use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::debug;

/// Kind of source a string refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `pattern://` synthetic stream
    Pattern,
    /// Local file made of concatenated JPEG pictures
    Mjpeg,
    /// Any other local file, needs a demuxer
    Container,
    /// Remote stream URL
    Network,
    /// Local path that does not exist
    Missing,
}

impl SourceKind {
    /// Auto-detect the backend for a source string
    pub fn detect(uri: &str) -> Self {
        if uri.starts_with("pattern://") {
            return SourceKind::Pattern;
        }
        let path = match uri.split_once("://") {
            Some(("file", rest)) => rest,
            Some(_) => return SourceKind::Network,
            None => uri,
        };

        let path = Path::new(path);
        if !path.is_file() {
            return SourceKind::Missing;
        }

        let mut magic = [0u8; 2];
        let is_jpeg = File::open(path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map(|_| magic == [0xFF, 0xD8])
            .unwrap_or(false);
        debug!(path = %path.display(), is_jpeg, "Probed local source");

        if is_jpeg {
            SourceKind::Mjpeg
        } else {
            SourceKind::Container
        }
    }
}

/// Local filesystem path of a source string, stripping a `file://` prefix
pub fn local_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

/// `key=value` pairs after the first `?`
pub fn query_pairs(uri: &str) -> impl Iterator<Item = (&str, &str)> {
    uri.split_once('?')
        .map(|(_, query)| query)
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_schemes() {
        assert_eq!(SourceKind::detect("pattern://?fps=5"), SourceKind::Pattern);
        assert_eq!(
            SourceKind::detect("rtmp://example.org:1935/vod/bbb.mp4"),
            SourceKind::Network
        );
        assert_eq!(SourceKind::detect("/no/such/file.h264"), SourceKind::Missing);
    }

    #[test]
    fn detects_jpeg_magic() {
        let mut mjpeg = tempfile::NamedTempFile::new().unwrap();
        mjpeg.write_all(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        assert_eq!(
            SourceKind::detect(mjpeg.path().to_str().unwrap()),
            SourceKind::Mjpeg
        );

        let mut other = tempfile::NamedTempFile::new().unwrap();
        other.write_all(&[0, 0, 0, 1, 0x67]).unwrap();
        let uri = format!("file://{}", other.path().display());
        assert_eq!(SourceKind::detect(&uri), SourceKind::Container);
    }

    #[test]
    fn parses_query() {
        let pairs: Vec<_> = query_pairs("pattern://?width=8&live&fps=2.5").collect();
        assert_eq!(pairs, vec![("width", "8"), ("live", ""), ("fps", "2.5")]);
        assert_eq!(query_pairs("pattern://").count(), 0);
    }
}
