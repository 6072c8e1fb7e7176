pub mod backup;
pub mod certificate;
pub mod common;
pub mod ini;
pub mod instance;
pub mod patroni;
pub mod pgbouncer;
pub mod secret;
pub mod service;

pub use common::{cluster_labels, instance_selector, object_meta, patroni_labels, role_labels};
