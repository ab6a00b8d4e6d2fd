use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Poem form requested from the model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoemStyle {
    #[default]
    Classic,
    Modern,
    Haiku,
    FreeVerse,
}

/// Language the poem is written in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoemLanguage {
    #[default]
    Korean,
    English,
    Japanese,
}

impl PoemStyle {
    pub const ALL: [PoemStyle; 4] = [
        PoemStyle::Classic,
        PoemStyle::Modern,
        PoemStyle::Haiku,
        PoemStyle::FreeVerse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoemStyle::Classic => "classic",
            PoemStyle::Modern => "modern",
            PoemStyle::Haiku => "haiku",
            PoemStyle::FreeVerse => "free_verse",
        }
    }
}

impl PoemLanguage {
    pub const ALL: [PoemLanguage; 3] = [
        PoemLanguage::Korean,
        PoemLanguage::English,
        PoemLanguage::Japanese,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoemLanguage::Korean => "korean",
            PoemLanguage::English => "english",
            PoemLanguage::Japanese => "japanese",
        }
    }

    /// Title used when the reply has no usable title line
    pub fn fallback_title(&self) -> &'static str {
        match self {
            PoemLanguage::Korean => "이미지에서 영감을 받은 시",
            PoemLanguage::English => "A Poem Inspired by an Image",
            PoemLanguage::Japanese => "画像からインスピレーションを得た詩",
        }
    }

    /// Title used when the reply could not be split at all
    pub fn short_fallback_title(&self) -> &'static str {
        match self {
            PoemLanguage::Korean => "이미지 시",
            PoemLanguage::English => "Image Poetry",
            PoemLanguage::Japanese => "画像詩",
        }
    }
}

/// Unknown style or language name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} must be one of [{allowed}], got '{value}'")]
pub struct UnknownOption {
    pub kind: &'static str,
    pub value: String,
    pub allowed: String,
}

impl FromStr for PoemStyle {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PoemStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == s)
            .ok_or_else(|| UnknownOption {
                kind: "Style",
                value: s.to_string(),
                allowed: PoemStyle::ALL.map(|s| s.as_str()).join(", "),
            })
    }
}

impl FromStr for PoemLanguage {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PoemLanguage::ALL
            .into_iter()
            .find(|language| language.as_str() == s)
            .ok_or_else(|| UnknownOption {
                kind: "Language",
                value: s.to_string(),
                allowed: PoemLanguage::ALL.map(|l| l.as_str()).join(", "),
            })
    }
}

impl fmt::Display for PoemStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PoemLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Markers that introduce the title line of a reply
pub const TITLE_MARKERS: [&str; 4] = ["제목:", "Title:", "タイトル:", "題名:"];

const KOREAN_CLASSIC: &str = "\
이 이미지를 바라보며 한국 전통 서정시 한 편을 지어 주세요.
아래 형식으로만 답해 주세요:

제목: [시의 제목]

[시 본문]

조건:
- 한국 고전 서정시의 정서와 운율
- 4~8행 분량
- 이미지에 담긴 감정과 분위기를 살릴 것
- 곱고 서정적인 시어 사용
";

const KOREAN_MODERN: &str = "\
이 이미지를 바라보며 현대적인 한국어 시 한 편을 지어 주세요.
아래 형식으로만 답해 주세요:

제목: [시의 제목]

[시 본문]

조건:
- 현대적이고 자유로운 형식
- 이미지의 지금 이 순간의 감각을 담을 것
- 일상적이지만 깊이 있는 언어
- 6~10행 분량
";

const KOREAN_HAIKU: &str = "\
이 이미지를 바라보며 하이쿠 형식(5-7-5 음절)의 한국어 시를 지어 주세요.
아래 형식으로만 답해 주세요:

제목: [시의 제목]

[첫째 행 - 5음절]
[둘째 행 - 7음절]
[셋째 행 - 5음절]

조건:
- 정확히 세 행, 5-7-5 음절을 지킬 것
- 자연과 계절감을 중심으로
- 짧고 함축적인 표현
";

const KOREAN_FREE_VERSE: &str = "\
이 이미지를 바라보며 형식에 얽매이지 않는 한국어 자유시를 지어 주세요.
아래 형식으로만 답해 주세요:

제목: [시의 제목]

[시 본문]

조건:
- 형식과 리듬 모두 자유롭게
- 실험적이고 창의적인 표현
- 이미지의 독특한 면을 드러낼 것
- 길이 제한 없음
";

const ENGLISH_CLASSIC: &str = "\
Look at this image and write a classical English poem about it.
Reply in exactly this format:

Title: [poem title]

[poem body]

Requirements:
- Traditional English lyric style
- Between 4 and 8 lines
- Capture the feeling and atmosphere of the image
- Use graceful, lyrical language
";

const ENGLISH_MODERN: &str = "\
Look at this image and write a modern English poem about it.
Reply in exactly this format:

Title: [poem title]

[poem body]

Requirements:
- Modern, open form
- Convey the contemporary mood of the image
- Plain yet resonant language
- Between 6 and 10 lines
";

const ENGLISH_HAIKU: &str = "\
Look at this image and write an English haiku (5-7-5 syllables) about it.
Reply in exactly this format:

Title: [poem title]

[line one - 5 syllables]
[line two - 7 syllables]
[line three - 5 syllables]

Requirements:
- Exactly three lines with a strict 5-7-5 syllable count
- Centre on nature and the season
- Brief, suggestive imagery
";

const ENGLISH_FREE_VERSE: &str = "\
Look at this image and write a free verse English poem about it.
Reply in exactly this format:

Title: [poem title]

[poem body]

Requirements:
- No fixed form or rhythm
- Experimental, inventive expression
- Bring out what is unusual in the image
- Any length
";

const JAPANESE_CLASSIC: &str = "\
この画像を見て、日本の伝統的な叙情詩を一篇作ってください。
次の形式だけで答えてください:

タイトル: [詩の題名]

[詩の本文]

条件:
- 伝統的な叙情詩の趣
- 4〜8行
- 画像の感情と雰囲気を表すこと
- 美しく叙情的な言葉を使うこと
";

const JAPANESE_MODERN: &str = "\
この画像を見て、現代的な日本語の詩を一篇作ってください。
次の形式だけで答えてください:

タイトル: [詩の題名]

[詩の本文]

条件:
- 現代的で自由な形式
- 画像の今の感覚を表すこと
- 日常的でありながら深みのある言葉
- 6〜10行
";

const JAPANESE_HAIKU: &str = "\
この画像を見て、俳句（五・七・五）を一句作ってください。
次の形式だけで答えてください:

タイトル: [句の題名]

[一行目 - 五音]
[二行目 - 七音]
[三行目 - 五音]

条件:
- 三行で五・七・五を厳密に守ること
- 自然と季節感を大切にすること
- 簡潔で含みのある表現
";

const JAPANESE_FREE_VERSE: &str = "\
この画像を見て、形式にとらわれない日本語の自由詩を作ってください。
次の形式だけで答えてください:

タイトル: [詩の題名]

[詩の本文]

条件:
- 形式もリズムも自由
- 実験的で創造的な表現
- 画像の独特な面を引き出すこと
- 長さの制限なし
";

/// Prompt for a (language, style) pair
pub fn prompt_for(language: PoemLanguage, style: PoemStyle) -> &'static str {
    match (language, style) {
        (PoemLanguage::Korean, PoemStyle::Classic) => KOREAN_CLASSIC,
        (PoemLanguage::Korean, PoemStyle::Modern) => KOREAN_MODERN,
        (PoemLanguage::Korean, PoemStyle::Haiku) => KOREAN_HAIKU,
        (PoemLanguage::Korean, PoemStyle::FreeVerse) => KOREAN_FREE_VERSE,
        (PoemLanguage::English, PoemStyle::Classic) => ENGLISH_CLASSIC,
        (PoemLanguage::English, PoemStyle::Modern) => ENGLISH_MODERN,
        (PoemLanguage::English, PoemStyle::Haiku) => ENGLISH_HAIKU,
        (PoemLanguage::English, PoemStyle::FreeVerse) => ENGLISH_FREE_VERSE,
        (PoemLanguage::Japanese, PoemStyle::Classic) => JAPANESE_CLASSIC,
        (PoemLanguage::Japanese, PoemStyle::Modern) => JAPANESE_MODERN,
        (PoemLanguage::Japanese, PoemStyle::Haiku) => JAPANESE_HAIKU,
        (PoemLanguage::Japanese, PoemStyle::FreeVerse) => JAPANESE_FREE_VERSE,
    }
}
