#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::allocation::NamespaceName;
use crate::common::{validate_bounded_text, validate_token_ascii};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const REQUEST_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

const FINGERPRINT_DOMAIN: &str = "nsalloc.request_identity.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Policy,
    Bsf,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Policy => "policy",
            WorkloadKind::Bsf => "bsf",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "policy" => Ok(WorkloadKind::Policy),
            "bsf" => Ok(WorkloadKind::Bsf),
            _ => Err(ContractViolation::InvalidValue {
                field: "request_identity.workload_kind",
                reason: "must be one of: policy, bsf",
            }),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How container images reach the cluster: bundled tarballs or an external registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryMode {
    Tgz,
    ExternalRegistry,
}

impl RegistryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryMode::Tgz => "tgz",
            RegistryMode::ExternalRegistry => "external_registry",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        match raw {
            "tgz" => Ok(RegistryMode::Tgz),
            "external_registry" => Ok(RegistryMode::ExternalRegistry),
            _ => Err(ContractViolation::InvalidValue {
                field: "request_identity.registry_mode",
                reason: "must be one of: tgz, external_registry",
            }),
        }
    }
}

/// Every field here participates in request equivalence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub workload_kind: WorkloadKind,
    pub release_tag: String,
    pub ancillary_release_tag: String,
    pub csar: bool,
    pub service_mesh_injection: bool,
    pub registry_mode: RegistryMode,
    pub internal_feature_set: bool,
    pub occ: bool,
    pub pcf: bool,
    pub converged: bool,
    pub pcrf: bool,
    pub tls_version: String,
    pub rollback: bool,
    pub official_build: bool,
    pub custom_message: String,
}

impl RequestIdentity {
    /// Minimal identity: every feature flag off, registry mode `Tgz`, empty ancillary tag.
    pub fn v1(
        workload_kind: WorkloadKind,
        release_tag: impl Into<String>,
        official_build: bool,
        rollback: bool,
    ) -> Result<Self, ContractViolation> {
        let identity = Self {
            workload_kind,
            release_tag: release_tag.into(),
            ancillary_release_tag: String::new(),
            csar: false,
            service_mesh_injection: false,
            registry_mode: RegistryMode::Tgz,
            internal_feature_set: false,
            occ: false,
            pcf: false,
            converged: false,
            pcrf: false,
            tls_version: "NO".to_string(),
            rollback,
            official_build,
            custom_message: "NULL".to_string(),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN.as_bytes());
        for (key, value) in self.canonical_fields() {
            hasher.update(b"\n");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Fingerprint(hex)
    }

    fn canonical_fields(&self) -> [(&'static str, String); 15] {
        [
            ("workload_kind", self.workload_kind.as_str().to_string()),
            ("release_tag", self.release_tag.clone()),
            ("ancillary_release_tag", self.ancillary_release_tag.clone()),
            ("csar", flag(self.csar)),
            ("service_mesh_injection", flag(self.service_mesh_injection)),
            ("registry_mode", self.registry_mode.as_str().to_string()),
            ("internal_feature_set", flag(self.internal_feature_set)),
            ("occ", flag(self.occ)),
            ("pcf", flag(self.pcf)),
            ("converged", flag(self.converged)),
            ("pcrf", flag(self.pcrf)),
            ("tls_version", self.tls_version.clone()),
            ("rollback", flag(self.rollback)),
            ("official_build", flag(self.official_build)),
            ("custom_message", self.custom_message.clone()),
        ]
    }
}

fn flag(v: bool) -> String {
    if v { "1" } else { "0" }.to_string()
}

impl Validate for RequestIdentity {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.release_tag.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "request_identity.release_tag",
                reason: "must be non-empty",
            });
        }
        validate_bounded_text("request_identity.release_tag", &self.release_tag, 128)?;
        validate_bounded_text(
            "request_identity.ancillary_release_tag",
            &self.ancillary_release_tag,
            128,
        )?;
        validate_bounded_text("request_identity.tls_version", &self.tls_version, 16)?;
        validate_bounded_text("request_identity.custom_message", &self.custom_message, 512)?;
        if self.workload_kind == WorkloadKind::Bsf
            && (self.pcf || self.converged || self.occ || self.pcrf)
        {
            return Err(ContractViolation::InvalidValue {
                field: "request_identity.workload_kind",
                reason: "bsf workloads must not carry policy-mode flags",
            });
        }
        if [self.pcf, self.converged, self.pcrf]
            .iter()
            .filter(|v| **v)
            .count()
            > 1
        {
            return Err(ContractViolation::InvalidValue {
                field: "request_identity.policy_mode",
                reason: "at most one of pcf, converged, pcrf may be set",
            });
        }
        Ok(())
    }
}

/// Hex SHA-256 over the canonical identity tuple; the allocation key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, ContractViolation> {
        let hex = hex.into();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ContractViolation::InvalidValue {
                field: "fingerprint",
                reason: "must be 64 lowercase hex characters",
            });
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized allocation request as delivered by a parameter source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub schema_version: SchemaVersion,
    pub identity: RequestIdentity,
    pub owner: Option<String>,
    pub pipeline_reference: Option<String>,
    pub pinned_namespace: Option<NamespaceName>,
}

impl Request {
    pub fn v1(
        identity: RequestIdentity,
        owner: Option<String>,
        pipeline_reference: Option<String>,
        pinned_namespace: Option<NamespaceName>,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: REQUEST_CONTRACT_VERSION,
            identity,
            owner,
            pipeline_reference,
            pinned_namespace,
        };
        req.validate()?;
        Ok(req)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }
}

impl Validate for Request {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != REQUEST_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "request.schema_version",
                reason: "must match REQUEST_CONTRACT_VERSION",
            });
        }
        self.identity.validate()?;
        if let Some(owner) = &self.owner {
            validate_token_ascii("request.owner", owner, 128)?;
        }
        if let Some(pipeline) = &self.pipeline_reference {
            validate_bounded_text("request.pipeline_reference", pipeline, 512)?;
        }
        if let Some(ns) = &self.pinned_namespace {
            ns.validate()?;
        }
        Ok(())
    }
}
