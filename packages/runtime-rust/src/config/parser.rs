//! Configuration content parsers.

use std::collections::BTreeMap;

use super::ConfigError;

/// Turns raw configuration content into key/value pairs.
pub trait ConfigurationParser: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed content.
    fn parse(&self, content: &str) -> Result<BTreeMap<String, String>, ConfigError>;
}

/// `key=value` (or `key: value`) lines; `#` and `!` start comments.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertiesParser;

impl ConfigurationParser for PropertiesParser {
    fn parse(&self, content: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut properties = BTreeMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some(split) = line.find(['=', ':']) else {
                return Err(ConfigError::Parse {
                    line: idx + 1,
                    reason: format!("missing separator in {line:?}"),
                });
            };
            let key = line[..split].trim();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    line: idx + 1,
                    reason: "empty key".to_string(),
                });
            }
            properties.insert(key.to_string(), line[split + 1..].trim().to_string());
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_separators_and_skips_comments() {
        let content = "# header\n! bang comment\n\nregistry.address = 127.0.0.1:8848\nname: greeter\nurl=http://a?b=c\n";
        let props = PropertiesParser.parse(content).unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(props["registry.address"], "127.0.0.1:8848");
        assert_eq!(props["name"], "greeter");
        assert_eq!(props["url"], "http://a?b=c");
    }

    #[test]
    fn empty_value_is_allowed() {
        let props = PropertiesParser.parse("flag=").unwrap();
        assert_eq!(props["flag"], "");
    }

    #[test]
    fn reports_line_of_malformed_entry() {
        let err = PropertiesParser.parse("a=1\njunk\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));
        assert!(matches!(PropertiesParser.parse("=v"), Err(ConfigError::Parse { line: 1, .. })));
    }
}
