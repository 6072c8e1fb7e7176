//! Owner references on dependent objects
//!
//! Every generated object points back at its PostgresCluster so the platform
//! garbage collector removes it with the cluster. An object has at most one
//! controlling owner; objects shared between clusters (the namespace root CA)
//! carry one non-controlling reference per cluster.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::controller::error::{Error, Result};

/// Record `owner` as an owner of `dependent`.
///
/// With `exclusive` the reference is marked as the controller, and an
/// existing controller reference to any other object is a conflict. A
/// reference to the same owner is replaced in place.
pub fn assign_owner<K>(owner: &K, dependent: &mut ObjectMeta, exclusive: bool) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let name = owner.name_any();
    let uid = owner
        .uid()
        .ok_or_else(|| Error::InvalidConfig(format!("owner {} has no uid", name)))?;

    let dependent_name = dependent.name.clone().unwrap_or_default();
    if let (Some(owner_ns), Some(dependent_ns)) = (owner.namespace(), dependent.namespace.as_ref())
    {
        if &owner_ns != dependent_ns {
            return Err(Error::InvalidConfig(format!(
                "{} in namespace {} cannot be owned by {} in namespace {}",
                dependent_name, dependent_ns, name, owner_ns
            )));
        }
    }

    let reference = OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: name.clone(),
        uid: uid.clone(),
        controller: Some(exclusive),
        block_owner_deletion: Some(true),
    };

    let refs = dependent.owner_references.get_or_insert_with(Vec::new);

    if exclusive {
        if let Some(other) = refs
            .iter()
            .find(|r| r.controller == Some(true) && r.uid != uid)
        {
            return Err(Error::AlreadyOwned {
                kind: other.kind.clone(),
                name: dependent_name,
                controller: other.name.clone(),
            });
        }
    }

    match refs.iter_mut().find(|r| r.uid == uid) {
        Some(existing) => *existing = reference,
        None => refs.push(reference),
    }
    Ok(())
}

/// Check whether `owner` is the controller of the object with `meta`
pub fn is_controlled_by<K>(owner: &K, meta: &ObjectMeta) -> bool
where
    K: Resource<DynamicType = ()>,
{
    let Some(uid) = owner.uid() else {
        return false;
    };
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}
