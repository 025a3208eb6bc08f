use crate::error::Result;
use crate::profile::{parse_url_spec, render_url_spec};
use regex::Regex;
use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::LazyLock;
use tokio::io::AsyncReadExt;
use tracing::warn;
use url::Url;

/// Turning free-form user input into `URL||overrides` tokens.

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s'"<>]+"#).expect("valid url pattern"));

/// True for absolute http(s) URLs.
pub fn is_valid_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false)
}

/// Every distinct URL in `text`, in order of appearance, with trailing
/// punctuation stripped.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    URL_PATTERN
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(|c| matches!(c, ')' | '.' | ',' | ';' | '?' | '!' | '"' | '\''))
                .to_string()
        })
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

/// Normalizes raw input lines into URL tokens.
///
/// Blank lines and `#` comments are skipped. A line whose URL part is not a
/// valid URL is rescued by taking the first URL found inside it; its
/// overrides are kept. Lines with no URL at all are dropped with a warning.
pub fn normalize_tokens<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    lines
        .iter()
        .map(|l| l.as_ref().trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let (url, overrides) = parse_url_spec(line);
            if is_valid_url(&url) {
                return Some(render_url_spec(&url, &overrides));
            }
            match extract_urls(&url).into_iter().next() {
                Some(found) => Some(render_url_spec(&found, &overrides)),
                None => {
                    warn!("Skipping invalid token: {}", line);
                    None
                }
            }
        })
        .collect()
}

/// URL tokens from arbitrary text such as a pasted chat log.
///
/// Lines written as `URL||overrides` keep their overrides; any other line
/// contributes every URL found in it.
pub fn tokens_from_text(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .flat_map(|line| {
            if line.contains("||") {
                normalize_tokens(&[line])
            } else {
                extract_urls(line)
            }
        })
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Text piped into stdin, or `None` when stdin is a terminal.
pub async fn read_piped_stdin() -> Result<Option<String>> {
    if std::io::stdin().is_terminal() {
        return Ok(None);
    }
    let mut text = String::new();
    tokio::io::stdin().read_to_string(&mut text).await?;
    Ok(Some(text))
}

/// Reads URL tokens from a text file, one per line.
pub async fn read_tokens(path: &Path) -> Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = text.lines().collect();
    Ok(normalize_tokens(&lines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validates_urls() {
        assert!(is_valid_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_valid_url("http://example.com"));
        assert!(!is_valid_url("ftp://example.com/file"));
        assert!(!is_valid_url("example.com"));
        assert!(!is_valid_url(""));
    }

    #[test]
    fn extracts_and_dedups_urls_from_prose() {
        let text = "watch (https://a.example/v?x=1), then https://b.example/w. Again: https://a.example/v?x=1";
        assert_eq!(
            extract_urls(text),
            vec!["https://a.example/v?x=1", "https://b.example/w"]
        );
    }

    #[test]
    fn normalizes_lines_and_keeps_overrides() {
        let lines = vec![
            "# comment",
            "",
            "https://a.example/v||audio,rate=1M",
            "see <https://b.example/w>||no-playlist",
            "no url here",
        ];
        assert_eq!(
            normalize_tokens(&lines),
            vec![
                "https://a.example/v||audio,rate=1M",
                "https://b.example/w||no-playlist"
            ]
        );
    }

    #[test]
    fn piped_text_yields_every_url() {
        let text = "links: https://a.example/1 and https://b.example/2\n\
                    https://c.example/3||audio\n\
                    again https://a.example/1\n";
        assert_eq!(
            tokens_from_text(text),
            vec![
                "https://a.example/1",
                "https://b.example/2",
                "https://c.example/3||audio"
            ]
        );
    }

    #[tokio::test]
    async fn reads_tokens_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("urls.txt");
        std::fs::write(&path, "https://a.example\n\n  https://b.example||audio  \n").unwrap();
        let tokens = read_tokens(&path).await.unwrap();
        assert_eq!(tokens, vec!["https://a.example", "https://b.example||audio"]);
    }
}
