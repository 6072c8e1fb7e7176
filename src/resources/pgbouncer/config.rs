//! pgbouncer.ini and the pooler credential file
//!
//! Everything here is a pure function of the cluster spec (and, for the
//! credential file, the stored password) so unchanged clusters render
//! byte-identical files.

use crate::crd::PostgresCluster;
use crate::naming::{self, PGBOUNCER_CONFIG_DIRECTORY, PGBOUNCER_USER};
use crate::resources::ini::{GENERATED_HEADER, IniValueSet, section};

/// Paths of projected files, relative to the configuration directory
pub const AUTH_FILE_PROJECTION_PATH: &str = "~postgres-operator/users.txt";
pub const INI_FILE_PROJECTION_PATH: &str = "~postgres-operator.ini";
pub const FRONTEND_CERT_PROJECTION_PATH: &str = "~postgres-operator/frontend.crt";
pub const FRONTEND_KEY_PROJECTION_PATH: &str = "~postgres-operator/frontend.key";
pub const FRONTEND_CA_PROJECTION_PATH: &str = "~postgres-operator/frontend-ca.crt";
pub const BACKEND_CA_PROJECTION_PATH: &str = "~postgres-operator/backend-ca.crt";

/// Query PgBouncer runs as `auth_user` to look up client credentials
pub const AUTH_QUERY: &str = "SELECT username, password from pgbouncer.get_auth($1)";

fn absolute(projection: &str) -> String {
    format!("{}/{}", PGBOUNCER_CONFIG_DIRECTORY, projection)
}

/// Render pgbouncer.ini for a cluster that declares a pooler.
///
/// Settings are grouped by precedence. PgBouncer applies the last value it
/// reads, so mandatory settings come last and cannot be overridden.
pub fn cluster_ini(cluster: &PostgresCluster) -> String {
    let pgbouncer_port = cluster.pgbouncer().map(|p| p.port()).unwrap_or_default();
    let postgres_port = cluster.postgres_port();

    let early = IniValueSet::from([("auth_user", PGBOUNCER_USER.to_string())]);

    let databases = format!(
        "[databases]\n* = host={} port={}\n",
        naming::cluster_primary_service(cluster),
        postgres_port
    );

    let defaults = IniValueSet::from([(
        "ignore_startup_parameters",
        "extra_float_digits".to_string(),
    )]);

    let mandatory = IniValueSet::from([
        ("auth_file", absolute(AUTH_FILE_PROJECTION_PATH)),
        ("auth_query", AUTH_QUERY.to_string()),
        ("auth_user", PGBOUNCER_USER.to_string()),
        // Clients must use TLS; the certificate is issued by the operator
        ("client_tls_sslmode", "require".to_string()),
        ("client_tls_cert_file", absolute(FRONTEND_CERT_PROJECTION_PATH)),
        ("client_tls_key_file", absolute(FRONTEND_KEY_PROJECTION_PATH)),
        ("client_tls_ca_file", absolute(FRONTEND_CA_PROJECTION_PATH)),
        ("conffile", absolute(INI_FILE_PROJECTION_PATH)),
        ("listen_addr", "*".to_string()),
        ("listen_port", pgbouncer_port.to_string()),
        // Connections to PostgreSQL verify the server against the cluster CA
        ("server_tls_sslmode", "verify-full".to_string()),
        ("server_tls_ca_file", absolute(BACKEND_CA_PROJECTION_PATH)),
        // Only TCP
        ("unix_socket_dir", String::new()),
    ]);

    let mut ini = String::from(GENERATED_HEADER);
    ini.push_str(&section("pgbouncer", &early));
    ini.push_str(&databases);
    ini.push_str(&section("pgbouncer", &defaults));
    ini.push_str(&section("pgbouncer", &mandatory));
    ini
}

/// Contents of the `auth_file`: the pooler's own login
pub fn auth_file_contents(password: &str) -> Vec<u8> {
    let quote = |s: &str| format!("\"{}\"", s.replace('"', "\"\""));
    format!("{} {}\n", quote(PGBOUNCER_USER), quote(password)).into_bytes()
}
