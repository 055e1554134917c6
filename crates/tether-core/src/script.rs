//! Script metadata exposed to managed code

use data_encoding::{BASE64, BASE64_NOPAD};
use once_cell::sync::Lazy;
use regex::Regex;

static SOURCE_MAP_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)//[#@][ \t]sourceMappingURL=[ \t]*data:application/json;base64,([^\s'"]*)[ \t]*$"#,
    )
    .unwrap()
});

/// Name and source of the script a core is bound to
#[derive(Debug, Clone)]
pub struct ScriptMeta {
    name: String,
    source: String,
}

impl ScriptMeta {
    /// Create metadata for a named script
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// The script's bare name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The script's source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The file name presented to scripts: `<name>.js`
    pub fn file_name(&self) -> String {
        format!("{}.js", self.name)
    }

    /// Inline source map payload, if the source carries one
    ///
    /// Recognizes `//# sourceMappingURL=` and the legacy `//@` form with a
    /// base64 `data:application/json` URI, and returns the decoded JSON
    /// text when it is valid UTF-8.
    pub fn source_map_data(&self) -> Option<String> {
        let captures = SOURCE_MAP_URL.captures(&self.source)?;
        let encoded = captures.get(1)?.as_str();

        let decoded = BASE64
            .decode(encoded.as_bytes())
            .or_else(|_| BASE64_NOPAD.decode(encoded.trim_end_matches('=').as_bytes()))
            .ok()?;

        String::from_utf8(decoded).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        let meta = ScriptMeta::new("agent", "");
        assert_eq!(meta.file_name(), "agent.js");
    }

    #[test]
    fn test_source_map_data_hash_form() {
        let payload = r#"{"version":3,"sources":["a.ts"]}"#;
        let encoded = BASE64.encode(payload.as_bytes());
        let source = format!(
            "console.log(1);\n//# sourceMappingURL=data:application/json;base64,{}",
            encoded
        );
        let meta = ScriptMeta::new("agent", source);
        assert_eq!(meta.source_map_data().as_deref(), Some(payload));
    }

    #[test]
    fn test_source_map_data_at_form() {
        let payload = "{}";
        let encoded = BASE64.encode(payload.as_bytes());
        let source = format!("//@ sourceMappingURL=data:application/json;base64,{}", encoded);
        let meta = ScriptMeta::new("agent", source);
        assert_eq!(meta.source_map_data().as_deref(), Some(payload));
    }

    #[test]
    fn test_source_map_data_absent() {
        let meta = ScriptMeta::new("agent", "console.log(1);");
        assert_eq!(meta.source_map_data(), None);
    }

    #[test]
    fn test_source_map_data_invalid_base64() {
        let meta = ScriptMeta::new(
            "agent",
            "//# sourceMappingURL=data:application/json;base64,@@!notbase64@@",
        );
        assert_eq!(meta.source_map_data(), None);
    }
}
