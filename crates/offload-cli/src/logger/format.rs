use std::str::FromStr;

use crate::logger::error::LoggerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerFormat {
    Text,
    Json,
}

impl FromStr for LoggerFormat {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LoggerFormat::Text),
            "json" => Ok(LoggerFormat::Json),
            _ => Err(LoggerError::InvalidFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("text", LoggerFormat::Text)]
    #[case(" JSON ", LoggerFormat::Json)]
    #[case("plain", LoggerFormat::Text)]
    fn parses_known_formats(#[case] raw: &str, #[case] expected: LoggerFormat) {
        assert_eq!(raw.parse::<LoggerFormat>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_format() {
        let err = "journald".parse::<LoggerFormat>().unwrap_err();
        assert!(matches!(err, LoggerError::InvalidFormat(ref s) if s == "journald"));
    }
}
