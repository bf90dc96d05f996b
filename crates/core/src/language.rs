//! Language metadata
//!
//! The speech model currently handles English and French; the language id is
//! metadata attached to transcripts, not a protocol parameter.

use serde::Serialize;

/// Information about a supported transcription language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LanguageInfo {
    pub code: &'static str,
    pub name: &'static str,
    #[serde(rename = "nativeName")]
    pub native_name: &'static str,
    pub rtl: bool,
}

pub const DEFAULT_LANGUAGE: &str = "en";

const LANGUAGES: &[LanguageInfo] = &[
    LanguageInfo {
        code: "en",
        name: "English",
        native_name: "English",
        rtl: false,
    },
    LanguageInfo {
        code: "fr",
        name: "French",
        native_name: "Français",
        rtl: false,
    },
];

/// All supported languages, for the languages API response.
pub fn supported_languages() -> &'static [LanguageInfo] {
    LANGUAGES
}

/// Whether a language code is supported (case-insensitive).
pub fn is_supported(code: &str) -> bool {
    LANGUAGES.iter().any(|l| l.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_and_french_are_supported() {
        assert!(is_supported("en"));
        assert!(is_supported("fr"));
        assert!(is_supported("EN"));
        assert!(!is_supported("de"));
    }

    #[test]
    fn default_language_is_supported() {
        assert!(is_supported(DEFAULT_LANGUAGE));
    }

    #[test]
    fn language_info_serializes_camel_case() {
        let json = serde_json::to_value(supported_languages()[1]).unwrap();
        assert_eq!(json["code"], "fr");
        assert_eq!(json["nativeName"], "Français");
    }
}
