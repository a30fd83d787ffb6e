//! The persisted machine configuration text: `[section]` headers followed by
//! `key = value` options, where a value may continue on indented lines.

use crate::error::{BedMeshError, Result};
use regex::Regex;
use std::fmt;
use std::fmt::Write as fmt_Write;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSection {
    name: String,
    // Kept in insertion order; the rendered layout is compared by hand.
    options: Vec<(String, String)>,
}

impl ConfigSection {
    pub fn new(name: &str) -> ConfigSection {
        ConfigSection {
            name: name.to_owned(),
            options: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parses a required option.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T>
    where
        T::Err: fmt::Display,
    {
        let raw = self.get(key).ok_or_else(|| {
            BedMeshError::Config(format!("option '{key}' in section '{}' must be specified", self.name))
        })?;
        raw.trim().parse().map_err(|e: T::Err| BedMeshError::Parse {
            input: raw.to_owned(),
            message: format!("option '{key}' in section '{}': {e}", self.name),
        })
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.options.push((key.to_owned(), value.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    sections: Vec<ConfigSection>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<ConfigFile> {
        static SECTION: OnceLock<Regex> = OnceLock::new();
        static OPTION: OnceLock<Regex> = OnceLock::new();
        let section_re = SECTION.get_or_init(|| Regex::new(r"^\[(?<name>[^\]]+)\]\s*$").expect("valid regex"));
        let option_re = OPTION
            .get_or_init(|| Regex::new(r"^(?<key>[^=:\s][^=:]*?)\s*[=:]\s*(?<value>.*)$").expect("valid regex"));

        let mut file = ConfigFile::default();
        let mut last_key: Option<String> = None;
        for raw in text.lines() {
            let line = raw.trim_end();
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            let indented = line.len() != trimmed.len();
            if indented {
                let (section, key) = match (file.sections.last_mut(), &last_key) {
                    (Some(section), Some(key)) => (section, key),
                    _ => {
                        return Err(BedMeshError::Parse {
                            input: raw.to_owned(),
                            message: "continuation line without an option".into(),
                        })
                    }
                };
                if let Some((_, v)) = section.options.iter_mut().find(|(k, _)| k == key) {
                    v.push('\n');
                    v.push_str(trimmed);
                }
                continue;
            }
            if let Some(captures) = section_re.captures(line) {
                let name = captures["name"].trim();
                file.section_mut(name);
                last_key = None;
                continue;
            }
            let Some(captures) = option_re.captures(line) else {
                return Err(BedMeshError::Parse {
                    input: raw.to_owned(),
                    message: "expected '[section]' or 'key = value'".into(),
                });
            };
            let Some(section) = file.sections.last_mut() else {
                return Err(BedMeshError::Parse {
                    input: raw.to_owned(),
                    message: "option outside of a section".into(),
                });
            };
            let key = captures["key"].to_lowercase();
            section.set(&key, &captures["value"]);
            last_key = Some(key);
        }
        Ok(file)
    }

    pub fn sections(&self) -> &[ConfigSection] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Returns the named section, appending an empty one if needed.
    pub fn section_mut(&mut self, name: &str) -> &mut ConfigSection {
        let index = match self.sections.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(ConfigSection::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }

    pub fn sections_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ConfigSection> + 'a {
        self.sections.iter().filter(move |s| s.name.starts_with(prefix))
    }

    pub fn remove_section(&mut self, name: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.name != name);
        self.sections.len() != before
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            writeln!(out, "[{}]", section.name).expect("write failed");
            for (key, value) in &section.options {
                let mut lines = value.split('\n');
                let first = lines.next().unwrap_or_default();
                if first.is_empty() {
                    writeln!(out, "{key} =").expect("write failed");
                } else {
                    writeln!(out, "{key} = {first}").expect("write failed");
                }
                for line in lines {
                    writeln!(out, "\t  {line}").expect("write failed");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "\
# machine config
[printer]
kinematics: cartesian

[bed_mesh default]
version = 1
points =
\t  0.100000, 0.200000
\t  -0.050000, 0.000000
algo = lagrange
";

    #[test]
    fn parses_sections_and_continuations() {
        let file = ConfigFile::parse(TEXT).unwrap();
        assert_eq!(file.sections().len(), 2);
        assert_eq!(file.section("printer").unwrap().get("kinematics"), Some("cartesian"));
        let mesh = file.section("bed_mesh default").unwrap();
        assert_eq!(mesh.parse::<u32>("version").unwrap(), 1);
        assert_eq!(
            mesh.get("points"),
            Some("\n0.100000, 0.200000\n-0.050000, 0.000000")
        );
        assert_eq!(file.sections_with_prefix("bed_mesh ").count(), 1);
    }

    #[test]
    fn render_round_trips_the_layout() {
        let file = ConfigFile::parse(TEXT).unwrap();
        let rendered = file.render();
        assert!(rendered.contains("[bed_mesh default]\nversion = 1\npoints =\n\t  0.100000, 0.200000\n"));
        assert_eq!(ConfigFile::parse(&rendered).unwrap(), file);
    }

    #[test]
    fn bad_values_report_the_option() {
        let file = ConfigFile::parse("[s]\ncount = three\n").unwrap();
        let err = file.section("s").unwrap().parse::<usize>("count").unwrap_err();
        assert!(matches!(err, BedMeshError::Parse { .. }));
        assert!(matches!(
            file.section("s").unwrap().parse::<usize>("missing"),
            Err(BedMeshError::Config(_))
        ));
    }

    #[test]
    fn rejects_orphan_lines() {
        assert!(ConfigFile::parse("key = 1\n").is_err());
        assert!(ConfigFile::parse("[s]\n  continued\n").is_err());
    }

    #[test]
    fn remove_section_reports_presence() {
        let mut file = ConfigFile::parse(TEXT).unwrap();
        assert!(file.remove_section("bed_mesh default"));
        assert!(!file.remove_section("bed_mesh default"));
        file.section_mut("bed_mesh other").set("version", "1");
        assert_eq!(file.sections().len(), 2);
    }
}
