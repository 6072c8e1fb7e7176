//! PostgreSQL server parameters

use std::collections::BTreeMap;

use crate::naming::{PG_TLS_CA_PATH, PG_TLS_CERT_PATH, PG_TLS_KEY_PATH};

/// Parameter names mapped to values, kept sorted by name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterSet(BTreeMap<String, String>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter. Names are case-insensitive in PostgreSQL and are
    /// stored in lower case.
    pub fn add(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Overlay every parameter of `other` onto this set
    pub fn merge(&mut self, other: &ParameterSet) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl<'a> FromIterator<(&'a String, &'a String)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (&'a String, &'a String)>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for (k, v) in iter {
            set.add(k, v);
        }
        set
    }
}

/// Parameters split by precedence
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parameters {
    /// Always applied; nothing can override them
    pub mandatory: ParameterSet,
    /// Applied unless a user sets the same parameter
    pub default: ParameterSet,
}

impl Parameters {
    /// Defaults, then user values, then mandatory values
    pub fn effective(&self, user: &ParameterSet) -> ParameterSet {
        let mut out = self.default.clone();
        out.merge(user);
        out.merge(&self.mandatory);
        out
    }
}

/// Parameters every cluster gets
pub fn new_parameters() -> Parameters {
    let mut parameters = Parameters::default();

    parameters.mandatory.add("wal_level", "logical");
    parameters.mandatory.add("ssl", "on");
    parameters.mandatory.add("ssl_cert_file", PG_TLS_CERT_PATH);
    parameters.mandatory.add("ssl_key_file", PG_TLS_KEY_PATH);
    parameters.mandatory.add("ssl_ca_file", PG_TLS_CA_PATH);

    parameters.default.add("jit", "off");
    parameters.default.add("password_encryption", "scram-sha-256");

    parameters
}
