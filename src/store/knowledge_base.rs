// Message descriptions keyed by message name, loaded from a markdown file
// of `### MESSAGE_NAME description...` sections.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    descriptions: HashMap<String, String>,
}

impl KnowledgeBase {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading knowledge base {}", path.display()))?;
        let kb = Self::parse(&content);
        info!(path = %path.display(), messages = kb.len(), "Knowledge base loaded");
        Ok(kb)
    }

    pub fn parse(content: &str) -> Self {
        let mut descriptions = HashMap::new();
        for section in content.split("###").skip(1) {
            let section = section.trim_start();
            let (name, rest) = match section.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest.trim()),
                None => (section.trim(), ""),
            };
            if name.is_empty() {
                continue;
            }
            descriptions.insert(name.to_ascii_uppercase(), rest.to_string());
        }
        Self { descriptions }
    }

    pub fn describe(&self, message: &str) -> Option<&str> {
        self.descriptions
            .get(&message.to_ascii_uppercase())
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "# MAVLink messages\n\n\
        ### GLOBAL_POSITION_INT The filtered global position.\nalt: altitude MSL in mm.\n\n\
        ### SYS_STATUS Battery and sensor health.\nvoltage_battery: mV\n\n\
        ### EMPTY\n";

    #[test]
    fn test_parse_sections() {
        let kb = KnowledgeBase::parse(SAMPLE);
        assert_eq!(kb.len(), 3);
        let desc = kb.describe("global_position_int").unwrap();
        assert!(desc.starts_with("The filtered global position."));
        assert!(desc.contains("altitude MSL in mm"));
        assert!(!desc.contains("SYS_STATUS"));
        assert!(kb.describe("EMPTY").is_none());
        assert!(kb.describe("UNKNOWN").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let kb = KnowledgeBase::load(file.path()).unwrap();
        assert!(kb.describe("SYS_STATUS").unwrap().contains("voltage_battery"));

        assert!(KnowledgeBase::load(Path::new("/nonexistent/kb.md")).is_err());
    }
}
