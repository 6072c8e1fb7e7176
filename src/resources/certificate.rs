//! TLS certificates issued by the operator
//!
//! Each namespace has one root certificate authority stored in a Secret that
//! every cluster in the namespace shares. Clusters get leaf certificates
//! signed by that root for their primary and pod Services; the pooler gets
//! one for its own Service.
//!
//! Generated material is reused as long as it still fits: a root is parsed
//! back from its Secret, and a leaf is kept while it was signed by the
//! current root and covers the expected DNS names.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};

use crate::controller::error::Result;
use crate::crd::PostgresCluster;
use crate::naming::{
    self, ROOT_CA_CERT_KEY, ROOT_CA_KEY_KEY, ROOT_CA_SECRET, TLS_CA_KEY, TLS_CERT_KEY, TLS_KEY_KEY,
};
use crate::resources::common::{cluster_labels, object_meta, secret_value};

const ROOT_COMMON_NAME: &str = "postgres-operator-ca";

/// Root certificate authority with its private key
pub struct RootCertificateAuthority {
    cert_pem: String,
    key: KeyPair,
    issuer: rcgen::Certificate,
}

impl RootCertificateAuthority {
    /// Generate a new self-signed root
    pub fn generate() -> Result<Self> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let issuer = params.self_signed(&key)?;
        Ok(Self {
            cert_pem: issuer.pem(),
            key,
            issuer,
        })
    }

    /// Parse a root previously stored by [`RootCertificateAuthority::to_secret_data`]
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        // Rebuilding the issuer from the stored parameters keeps the same
        // subject and key, so leaves verify against the stored certificate.
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let issuer = params.self_signed(&key)?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key,
            issuer,
        })
    }

    /// Reuse the root in `existing` when it parses; generate a new one otherwise
    pub fn from_secret_or_generate(existing: Option<&Secret>) -> Result<Self> {
        let data = existing.and_then(|s| s.data.as_ref());
        if let (Some(cert), Some(key)) = (
            secret_value(data, ROOT_CA_CERT_KEY),
            secret_value(data, ROOT_CA_KEY_KEY),
        ) {
            match Self::from_pem(&cert, &key) {
                Ok(root) => return Ok(root),
                Err(e) => tracing::warn!(error = %e, "Stored root CA is unusable, generating a new one"),
            }
        }
        Self::generate()
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                ROOT_CA_CERT_KEY.to_string(),
                ByteString(self.cert_pem.clone().into_bytes()),
            ),
            (
                ROOT_CA_KEY_KEY.to_string(),
                ByteString(self.key.serialize_pem().into_bytes()),
            ),
        ])
    }

    /// Issue a server certificate for `dns_names`
    pub fn issue_leaf(&self, common_name: &str, dns_names: &[String]) -> Result<LeafCertificate> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(dns_names.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.issuer, &self.key)?;
        Ok(LeafCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Leaf certificate and private key in PEM form
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

impl LeafCertificate {
    /// Keep `cert_pem`/`key_pem` when they were issued by `root` (recorded as
    /// `ca_pem` next to them) and cover exactly `dns_names`.
    pub fn reusable(
        cert_pem: Option<String>,
        key_pem: Option<String>,
        ca_pem: Option<String>,
        root: &RootCertificateAuthority,
        dns_names: &[String],
    ) -> Option<Self> {
        let (cert_pem, key_pem, ca_pem) = (cert_pem?, key_pem?, ca_pem?);
        if ca_pem != root.cert_pem() {
            return None;
        }
        if KeyPair::from_pem(&key_pem).is_err() {
            return None;
        }
        let params = CertificateParams::from_ca_cert_pem(&cert_pem).ok()?;
        let mut current: Vec<&str> = params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::DnsName(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        let mut expected: Vec<&str> = dns_names.iter().map(String::as_str).collect();
        current.sort_unstable();
        expected.sort_unstable();
        (current == expected).then_some(Self { cert_pem, key_pem })
    }

    /// Reuse the leaf in `existing` or issue a new one
    pub fn from_secret_or_issue(
        existing: Option<&Secret>,
        keys: (&str, &str, &str),
        root: &RootCertificateAuthority,
        common_name: &str,
        dns_names: &[String],
    ) -> Result<Self> {
        let data = existing.and_then(|s| s.data.as_ref());
        let (cert_key, key_key, ca_key) = keys;
        match Self::reusable(
            secret_value(data, cert_key),
            secret_value(data, key_key),
            secret_value(data, ca_key),
            root,
            dns_names,
        ) {
            Some(leaf) => Ok(leaf),
            None => root.issue_leaf(common_name, dns_names),
        }
    }
}

/// DNS names of the cluster leaf certificate
pub fn cluster_dns_names(cluster: &PostgresCluster) -> Vec<String> {
    let ns = cluster.namespace().unwrap_or_default();
    let pods = naming::cluster_pod_service(cluster);
    let mut names = naming::service_dns_names(&naming::cluster_primary_service(cluster), &ns);
    names.extend(naming::service_dns_names(&pods, &ns));
    names.push(format!("*.{}.{}.svc.cluster.local", pods, ns));
    names
}

/// Secret holding the shared root certificate authority
pub fn generate_root_ca_secret(
    cluster: &PostgresCluster,
    root: &RootCertificateAuthority,
) -> Secret {
    let mut labels = cluster_labels(cluster);
    // Shared by every cluster in the namespace
    labels.remove(naming::LABEL_CLUSTER);
    Secret {
        metadata: object_meta(cluster, ROOT_CA_SECRET.to_string(), labels),
        data: Some(root.to_secret_data()),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Secret holding the cluster leaf certificate
pub fn generate_cluster_cert_secret(
    cluster: &PostgresCluster,
    root: &RootCertificateAuthority,
    leaf: &LeafCertificate,
) -> Secret {
    Secret {
        metadata: object_meta(
            cluster,
            naming::cluster_certificate(cluster),
            cluster_labels(cluster),
        ),
        data: Some(BTreeMap::from([
            (
                TLS_CERT_KEY.to_string(),
                ByteString(leaf.cert_pem.clone().into_bytes()),
            ),
            (
                TLS_KEY_KEY.to_string(),
                ByteString(leaf.key_pem.clone().into_bytes()),
            ),
            (
                TLS_CA_KEY.to_string(),
                ByteString(root.cert_pem().to_string().into_bytes()),
            ),
        ])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}
