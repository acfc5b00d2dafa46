use std::fmt;
use std::io::{self, Read};

/// MIME types offered when serving text, most specific first.
///
/// The X11-style names are included because XWayland bridges clipboard
/// contents between the two worlds using them.
pub const TEXT_MIME_TYPES: &[&str] = &[
    "text/plain;charset=utf-8",
    "text/plain",
    "UTF8_STRING",
    "STRING",
    "TEXT",
];

/// Which selection buffer an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    /// Currently highlighted text, updated by selecting
    Primary,
    /// Explicit copy/paste buffer
    Clipboard,
}

impl SelectionKind {
    pub fn name(self) -> &'static str {
        match self {
            SelectionKind::Primary => "PRIMARY",
            SelectionKind::Clipboard => "CLIPBOARD",
        }
    }
}

impl fmt::Display for SelectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the preferred text MIME type out of the types an offer advertises.
/// Returns None when the offer carries no plain text at all.
pub fn pick_text_mime(offered: &[String]) -> Option<&'static str> {
    TEXT_MIME_TYPES
        .iter()
        .copied()
        .find(|wanted| offered.iter().any(|m| m == wanted))
}

/// Read a stream to the end, keeping at most `cap` bytes.
///
/// Anything past the cap is drained and dropped so the writer on the other
/// end never blocks on a full pipe.
pub fn read_capped<R: Read>(mut reader: R, cap: usize) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0usize;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let room = cap.saturating_sub(kept.len());
        let take = n.min(room);
        kept.extend_from_slice(&chunk[..take]);
        dropped += n - take;
    }

    if dropped > 0 {
        log::debug!("Truncated input to {} bytes ({} dropped)", cap, dropped);
    }

    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mimes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pick_prefers_utf8_plain_text() {
        let offered = mimes(&["TEXT", "text/plain", "text/plain;charset=utf-8", "text/html"]);
        assert_eq!(pick_text_mime(&offered), Some("text/plain;charset=utf-8"));
    }

    #[test]
    fn test_pick_falls_back_to_x11_names() {
        let offered = mimes(&["image/png", "STRING"]);
        assert_eq!(pick_text_mime(&offered), Some("STRING"));
    }

    #[test]
    fn test_pick_rejects_non_text_offer() {
        let offered = mimes(&["image/png", "text/html"]);
        assert_eq!(pick_text_mime(&offered), None);
        assert_eq!(pick_text_mime(&[]), None);
    }

    #[test]
    fn test_read_capped_keeps_everything_under_cap() {
        let data = b"line one\nline two\x00\x1b[0m".to_vec();
        let read = read_capped(&data[..], 1024).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_read_capped_truncates_silently() {
        let data = vec![b'x'; 20_000];
        let read = read_capped(&data[..], 10_000).unwrap();
        assert_eq!(read.len(), 10_000);
    }

    #[test]
    fn test_selection_kind_names() {
        assert_eq!(SelectionKind::Primary.to_string(), "PRIMARY");
        assert_eq!(SelectionKind::Clipboard.name(), "CLIPBOARD");
    }
}
