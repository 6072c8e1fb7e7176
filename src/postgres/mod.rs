//! PostgreSQL server configuration shared by the generators

pub mod hba;
pub mod parameters;

pub use hba::{HBAs, HostBasedAuthentication, default_hbas, mandatory_hbas};
pub use parameters::{ParameterSet, Parameters, new_parameters};
