//! INI-style configuration files shared by PgBouncer and pgBackRest

use std::collections::BTreeMap;
use std::fmt::Write;

/// First lines of every generated configuration file
pub const GENERATED_HEADER: &str =
    "# Generated by postgres-operator. DO NOT EDIT.\n# Your changes will not be saved.\n";

/// Keys and values of one INI section, emitted in key order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniValueSet(BTreeMap<String, String>);

impl IniValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Render as `key = value` lines
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.0 {
            // Writing to a String cannot fail
            let _ = writeln!(out, "{} = {}", k, v);
        }
        out
    }
}

impl<const N: usize> From<[(&str, String); N]> for IniValueSet {
    fn from(pairs: [(&str, String); N]) -> Self {
        let mut set = IniValueSet::new();
        for (k, v) in pairs {
            set.set(k, v);
        }
        set
    }
}

/// Render a section header followed by its values
pub fn section(name: &str, values: &IniValueSet) -> String {
    format!("\n[{}]\n{}", name, values.render())
}
