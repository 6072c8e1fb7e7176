//! Host-based authentication (pg_hba.conf) rules

use std::fmt;

use crate::naming::{PG_REPLICATION_USER, PG_SUPERUSER};

/// One pg_hba.conf line, built with chained setters.
///
/// Unset fields fall back to `all`. TCP rules match every client address;
/// `local` rules have no address column.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostBasedAuthentication {
    origin: &'static str,
    database: Option<String>,
    user: Option<String>,
    method: String,
}

impl HostBasedAuthentication {
    pub fn new() -> Self {
        Self {
            origin: "host",
            ..Default::default()
        }
    }

    /// Unix domain socket connections
    pub fn local(mut self) -> Self {
        self.origin = "local";
        self
    }

    /// TCP connections, with or without TLS
    pub fn tcp(mut self) -> Self {
        self.origin = "host";
        self
    }

    /// TCP connections that use TLS
    pub fn tls(mut self) -> Self {
        self.origin = "hostssl";
        self
    }

    pub fn user(mut self, name: &str) -> Self {
        self.user = Some(quote(name));
        self
    }

    pub fn database(mut self, name: &str) -> Self {
        self.database = Some(quote(name));
        self
    }

    /// Matches physical replication connections
    pub fn replication(mut self) -> Self {
        self.database = Some("replication".to_string());
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

impl fmt::Display for HostBasedAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let database = self.database.as_deref().unwrap_or("all");
        let user = self.user.as_deref().unwrap_or("all");
        if self.origin == "local" {
            write!(f, "local {} {} {}", database, user, self.method)
        } else {
            write!(f, "{} {} {} all {}", self.origin, database, user, self.method)
        }
    }
}

/// Rules installed in every cluster. Mandatory rules come first and cannot be
/// overridden; default rules apply to anything not matched earlier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HBAs {
    pub mandatory: Vec<HostBasedAuthentication>,
    pub default: Vec<HostBasedAuthentication>,
}

impl HBAs {
    /// Rules in evaluation order
    pub fn rendered(&self) -> Vec<String> {
        self.mandatory
            .iter()
            .chain(self.default.iter())
            .map(ToString::to_string)
            .collect()
    }
}

/// Rules every cluster needs regardless of its spec
pub fn mandatory_hbas() -> Vec<HostBasedAuthentication> {
    vec![
        // The superuser can only log in over the local socket with OS identity
        HostBasedAuthentication::new()
            .local()
            .user(PG_SUPERUSER)
            .method("peer"),
        HostBasedAuthentication::new()
            .tcp()
            .replication()
            .user(PG_REPLICATION_USER)
            .method("md5"),
        // pg_rewind connects to the postgres database as the replication user
        HostBasedAuthentication::new()
            .tcp()
            .database(PG_SUPERUSER)
            .user(PG_REPLICATION_USER)
            .method("md5"),
        HostBasedAuthentication::new()
            .tcp()
            .user(PG_REPLICATION_USER)
            .method("reject"),
    ]
}

/// Rules applied after all mandatory rules
pub fn default_hbas() -> Vec<HostBasedAuthentication> {
    vec![HostBasedAuthentication::new().tls().method("md5")]
}
