use crate::prompts::{PoemLanguage, TITLE_MARKERS};
use crate::record_store::MAX_TITLE_CHARS;
use serde::{Deserialize, Serialize};

/// A generated poem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poem {
    pub title: String,
    pub body: String,
}

/// Split a model reply into title and body.
///
/// A line starting with one of [`TITLE_MARKERS`] names the title and the
/// lines after it form the body. Without a marker the first line is the
/// title. A title that will not fit the title column discards the split in
/// favour of the short fallback title and the whole reply as body.
pub fn parse_reply(reply: &str, language: PoemLanguage) -> Poem {
    let trimmed = reply.trim();
    match split_reply(trimmed, language) {
        Some(poem) => poem,
        None => Poem {
            title: language.short_fallback_title().to_string(),
            body: trimmed.to_string(),
        },
    }
}

fn split_reply(trimmed: &str, language: PoemLanguage) -> Option<Poem> {
    let lines: Vec<&str> = trimmed.split('\n').collect();
    let mut title = String::new();
    let mut body = String::new();

    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if TITLE_MARKERS.iter().any(|marker| line.starts_with(marker)) {
            if let Some((_, rest)) = line.split_once(':') {
                title = rest.trim().to_string();
            }
            body = lines[i + 1..].join("\n").trim().to_string();
            break;
        }
    }

    if title.is_empty() {
        if let Some(first) = lines.first() {
            title = first.trim().to_string();
            body = if lines.len() > 1 {
                lines[1..].join("\n").trim().to_string()
            } else {
                first.trim().to_string()
            };
        }
    }

    if title.is_empty() {
        title = language.fallback_title().to_string();
    }
    if body.is_empty() {
        body = trimmed.to_string();
    }

    if title.chars().count() > MAX_TITLE_CHARS {
        return None;
    }

    Some(Poem { title, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_line_names_title() {
        let poem = parse_reply("제목: 봄\n\n꽃이 핀다\n새가 운다", PoemLanguage::Korean);
        assert_eq!(poem.title, "봄");
        assert_eq!(poem.body, "꽃이 핀다\n새가 운다");
    }

    #[test]
    fn test_marker_found_after_preamble() {
        let reply = "Here is your poem.\n  Title: Harbour Lights  \n\nThe boats come home\nat dusk";
        let poem = parse_reply(reply, PoemLanguage::English);
        assert_eq!(poem.title, "Harbour Lights");
        assert_eq!(poem.body, "The boats come home\nat dusk");
    }

    #[test]
    fn test_japanese_markers() {
        let poem = parse_reply("タイトル: 古池\n\n古池や\n蛙飛び込む\n水の音", PoemLanguage::Japanese);
        assert_eq!(poem.title, "古池");
        assert_eq!(poem.body, "古池や\n蛙飛び込む\n水の音");

        let poem = parse_reply("題名: 月\n月が出た", PoemLanguage::Japanese);
        assert_eq!(poem.title, "月");
        assert_eq!(poem.body, "月が出た");
    }

    #[test]
    fn test_without_marker_first_line_is_title() {
        let poem = parse_reply("Sea\nwaves\nfoam", PoemLanguage::English);
        assert_eq!(poem.title, "Sea");
        assert_eq!(poem.body, "waves\nfoam");
    }

    #[test]
    fn test_single_line_is_title_and_body() {
        let poem = parse_reply("  only one line  ", PoemLanguage::English);
        assert_eq!(poem.title, "only one line");
        assert_eq!(poem.body, "only one line");
    }

    #[test]
    fn test_marker_without_body_uses_whole_reply() {
        let poem = parse_reply("Title: Alone", PoemLanguage::English);
        assert_eq!(poem.title, "Alone");
        assert_eq!(poem.body, "Title: Alone");
    }

    #[test]
    fn test_empty_marker_title_falls_back_to_first_line() {
        let poem = parse_reply("Title:\nrain on the roof", PoemLanguage::English);
        assert_eq!(poem.title, "Title:");
        assert_eq!(poem.body, "rain on the roof");
    }

    #[test]
    fn test_empty_reply_uses_long_fallback() {
        let poem = parse_reply("   ", PoemLanguage::Japanese);
        assert_eq!(poem.title, "画像からインスピレーションを得た詩");
        assert_eq!(poem.body, "");
    }

    #[test]
    fn test_overlong_title_uses_short_fallback() {
        let long_line = "가".repeat(MAX_TITLE_CHARS + 1);
        let reply = format!("{long_line}\n둘째 줄");
        let poem = parse_reply(&reply, PoemLanguage::Korean);

        assert_eq!(poem.title, "이미지 시");
        assert_eq!(poem.body, reply);
    }

    #[test]
    fn test_title_at_column_width_is_kept() {
        let title = "a".repeat(MAX_TITLE_CHARS);
        let poem = parse_reply(&format!("Title: {title}\nbody"), PoemLanguage::English);
        assert_eq!(poem.title, title);
    }
}
