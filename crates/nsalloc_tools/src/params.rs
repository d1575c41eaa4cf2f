#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use nsalloc_contracts::allocation::NamespaceName;
use nsalloc_contracts::request::{RegistryMode, Request, RequestIdentity, WorkloadKind};
use nsalloc_contracts::{ContractViolation, Validate};
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

/// Every input the pipeline may hand over, by its CI variable name.
pub const PARAMETER_KEYS: [&str; 20] = [
    "BUILD_NF",
    "POLICY_RELEASE_TAG",
    "BSF_RELEASE_TAG",
    "ATS_RELEASE_TAG",
    "UPG_FEATURE_1",
    "UPG_FEATURE_2",
    "UPG_FEATURE_3",
    "UPG_FEATURE_4",
    "POLICY_MODE",
    "REPORT",
    "CSAR_DEPLOYMENT",
    "ENABLE_ISTIO_INJECTION",
    "USE_EXTERNAL_DOCKER_REGISTRY",
    "INCLUDE_OCC_FEATURES",
    "INCLUDE_INTERNAL_ATS_FEATURES",
    "TLS_VERSION",
    "CUSTOM_NOTIFICATION_MESSAGE",
    "NAMESPACE",
    "GITLAB_USER_LOGIN",
    "CI_PIPELINE_URL",
];

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("missing parameter {0}")]
    Missing(&'static str),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("yaml document has no variables section")]
    NoVariables,
    #[error(transparent)]
    InvalidRequest(#[from] ContractViolation),
}

pub type RawParameters = BTreeMap<String, String>;

/// Supplies the normalized request for the current pipeline.
pub trait ParameterSource {
    fn raw_parameters(&self) -> Result<RawParameters, ParamError>;

    fn load(&self, pinned_prefix: &str) -> Result<Request, ParamError> {
        request_from_parameters(&self.raw_parameters()?, pinned_prefix)
    }
}

/// Reads the fixed variable set from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvParameterSource;

impl ParameterSource for EnvParameterSource {
    fn raw_parameters(&self) -> Result<RawParameters, ParamError> {
        Ok(PARAMETER_KEYS
            .iter()
            .filter_map(|key| env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect())
    }
}

/// Reads the `variables` map of the first job section of a pipeline YAML file.
#[derive(Debug, Clone)]
pub struct YamlParameterSource {
    path: PathBuf,
}

impl YamlParameterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ParameterSource for YamlParameterSource {
    fn raw_parameters(&self) -> Result<RawParameters, ParamError> {
        let text = fs::read_to_string(&self.path).map_err(|source| ParamError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_yaml_parameters(&text)
    }
}

pub fn parse_yaml_parameters(text: &str) -> Result<RawParameters, ParamError> {
    let doc: Value = serde_yaml::from_str(text)?;
    let Value::Mapping(top) = doc else {
        return Err(ParamError::NoVariables);
    };
    let variables = top
        .iter()
        .filter(|(key, _)| key.as_str() != Some("stages"))
        .find_map(|(_, section)| section.get("variables"))
        .and_then(Value::as_mapping)
        .ok_or(ParamError::NoVariables)?;
    let mut out = RawParameters::new();
    for (key, value) in variables {
        let (Some(key), Some(value)) = (key.as_str(), scalar_to_string(value)) else {
            continue;
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_true(params: &RawParameters, key: &str) -> bool {
    params
        .get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn non_empty<'a>(params: &'a RawParameters, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Maps raw pipeline variables onto a validated [`Request`]. `NAMESPACE` only pins when
/// it carries `pinned_prefix`.
pub fn request_from_parameters(
    params: &RawParameters,
    pinned_prefix: &str,
) -> Result<Request, ParamError> {
    let kind = WorkloadKind::parse(non_empty(params, "BUILD_NF").ok_or(ParamError::Missing("BUILD_NF"))?)?;
    let tag_key = match kind {
        WorkloadKind::Policy => "POLICY_RELEASE_TAG",
        WorkloadKind::Bsf => "BSF_RELEASE_TAG",
    };
    let release_tag = non_empty(params, tag_key).ok_or(ParamError::Missing(tag_key))?;
    let rollback = (1..=4).any(|n| is_true(params, &format!("UPG_FEATURE_{n}")));
    let official_build = is_true(params, "REPORT");

    let mut identity = RequestIdentity::v1(kind, release_tag, official_build, rollback)?;
    identity.ancillary_release_tag = non_empty(params, "ATS_RELEASE_TAG")
        .unwrap_or_default()
        .to_string();
    identity.csar = is_true(params, "CSAR_DEPLOYMENT");
    identity.service_mesh_injection = is_true(params, "ENABLE_ISTIO_INJECTION");
    if is_true(params, "USE_EXTERNAL_DOCKER_REGISTRY") {
        identity.registry_mode = RegistryMode::ExternalRegistry;
    }
    identity.internal_feature_set = is_true(params, "INCLUDE_INTERNAL_ATS_FEATURES");
    if kind == WorkloadKind::Policy {
        identity.occ = is_true(params, "INCLUDE_OCC_FEATURES");
        match non_empty(params, "POLICY_MODE").map(str::to_ascii_lowercase).as_deref() {
            Some("pcf") => identity.pcf = true,
            Some("occnp") => identity.converged = true,
            Some("pcrf") => identity.pcrf = true,
            _ => {}
        }
    }
    if let Some(tls) = non_empty(params, "TLS_VERSION") {
        identity.tls_version = tls.to_string();
    }
    if let Some(message) = non_empty(params, "CUSTOM_NOTIFICATION_MESSAGE") {
        identity.custom_message = message.to_string();
    }
    identity.validate()?;

    let pinned_namespace = match non_empty(params, "NAMESPACE") {
        Some(ns) if ns.starts_with(pinned_prefix) => Some(NamespaceName::new(ns)?),
        Some(ns) => {
            debug!(namespace = ns, "ignoring NAMESPACE without the pinned prefix");
            None
        }
        None => None,
    };
    let request = Request::v1(
        identity,
        non_empty(params, "GITLAB_USER_LOGIN").map(str::to_string),
        non_empty(params, "CI_PIPELINE_URL").map(str::to_string),
        pinned_namespace,
    )?;
    Ok(request)
}
