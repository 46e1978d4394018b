//! `.pls` / `.m3u` candidate extraction.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Pls,
    M3u,
}

impl PlaylistKind {
    /// Classify by the URL path's extension, ignoring query and fragment.
    pub fn detect(url: &str) -> Option<Self> {
        let path = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed.path().to_ascii_lowercase(),
            Err(_) => url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase(),
        };
        if path.ends_with(".pls") {
            Some(Self::Pls)
        } else if path.ends_with(".m3u") || path.ends_with(".m3u8") {
            Some(Self::M3u)
        } else {
            None
        }
    }

    /// Candidate stream URLs in file order.
    pub fn extract(self, body: &str) -> Vec<String> {
        match self {
            Self::Pls => parse_pls(body),
            Self::M3u => parse_m3u(body),
        }
    }
}

fn pls_entry() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*File\d+\s*=(.*)$").expect("valid pls pattern"))
}

pub fn parse_pls(content: &str) -> Vec<String> {
    pls_entry()
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_m3u(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_by_extension() {
        assert_eq!(PlaylistKind::detect("http://x/listen.pls"), Some(PlaylistKind::Pls));
        assert_eq!(PlaylistKind::detect("http://x/LISTEN.PLS?sid=1"), Some(PlaylistKind::Pls));
        assert_eq!(PlaylistKind::detect("https://x/a.m3u"), Some(PlaylistKind::M3u));
        assert_eq!(PlaylistKind::detect("https://x/a.m3u8"), Some(PlaylistKind::M3u));
        assert_eq!(PlaylistKind::detect("http://x/stream/"), None);
        assert_eq!(PlaylistKind::detect("http://x/stream.mp3"), None);
    }

    #[test]
    fn pls_entries_in_file_order() {
        let body = "[playlist]\r\nNumberOfEntries=3\r\nfile2=http://b/2\r\nTitle1=First\r\nFile1 = http://a/1 \r\nFILE10=http://c/10\r\nLength1=-1\r\n";
        assert_eq!(
            parse_pls(body),
            vec!["http://b/2", "http://a/1", "http://c/10"]
        );
    }

    #[test]
    fn pls_without_files_is_empty() {
        assert!(parse_pls("[playlist]\nNumberOfEntries=0\nVersion=2\n").is_empty());
    }

    #[test]
    fn m3u_skips_comments_and_blanks() {
        let body = "#EXTM3U\n\n#EXTINF:-1,Station One\nhttp://one/stream\n  \n#EXTINF:-1,Two\n  http://two/stream  \n";
        assert_eq!(parse_m3u(body), vec!["http://one/stream", "http://two/stream"]);
    }

    #[test]
    fn extraction_is_deterministic() {
        let body = "File1=http://a\nFile2=http://b\n";
        let first = PlaylistKind::Pls.extract(body);
        for _ in 0..5 {
            assert_eq!(PlaylistKind::Pls.extract(body), first);
        }
    }
}
