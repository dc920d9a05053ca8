//! Selector Index: which MachineConfigs belong to which pool
//!
//! A pool selects fragments with a standard Kubernetes `LabelSelector`,
//! evaluated with [`kube::core::Selector`]. Unlike Kubernetes list semantics,
//! an absent or empty selector matches nothing: a pool without a real
//! selector must never absorb every MachineConfig in the cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use mcfg_common::crd::MachineConfig;
use thiserror::Error;

/// A malformed selector
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// Rejected by the label selector parser, e.g. an unknown operator
    #[error("invalid label selector: {message}")]
    Parse {
        /// Parser message
        message: String,
    },

    /// In/NotIn without values
    #[error("values: must be specified when `operator` is 'In' or 'NotIn' (key {key})")]
    MissingValues {
        /// Requirement key
        key: String,
    },

    /// Exists/DoesNotExist with values
    #[error("values: may not be specified when `operator` is 'Exists' or 'DoesNotExist' (key {key})")]
    UnexpectedValues {
        /// Requirement key
        key: String,
    },

    /// Key is not a valid qualified label name
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// Value is not a valid label value
    #[error("invalid label value {value:?} for key {key}")]
    InvalidValue {
        /// Requirement key
        key: String,
        /// The rejected value
        value: String,
    },
}

/// How a pool's selector field should be treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSelector {
    /// No selector at all: the pool selects nothing
    Absent,
    /// A present but empty selector, which would select everything
    All,
    /// A selector with at least one requirement
    Matching(Selector),
}

impl PoolSelector {
    /// Classify, validate and parse a pool's selector field
    pub fn from_field(selector: Option<&LabelSelector>) -> Result<Self, SelectorError> {
        let Some(selector) = selector else {
            return Ok(Self::Absent);
        };
        validate(selector)?;
        let parsed = Selector::try_from(selector.clone()).map_err(|e| SelectorError::Parse {
            message: e.to_string(),
        })?;
        if parsed.selects_all() {
            Ok(Self::All)
        } else {
            Ok(Self::Matching(parsed))
        }
    }

    /// Whether `labels` are selected. Only `Matching` ever selects anything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Matching(s) => s.matches(labels),
            Self::Absent | Self::All => false,
        }
    }
}

impl fmt::Display for PoolSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "<none>"),
            Self::All => write!(f, "<everything>"),
            Self::Matching(s) => write!(f, "{}", s),
        }
    }
}

/// MachineConfigs selected by a pool's selector field.
///
/// Absent and empty selectors return nothing.
pub fn select_machine_configs(
    selector: Option<&LabelSelector>,
    configs: &[Arc<MachineConfig>],
) -> Result<Vec<Arc<MachineConfig>>, SelectorError> {
    let selector = PoolSelector::from_field(selector)?;
    Ok(configs
        .iter()
        .filter(|mc| selector.matches(mc.label_map()))
        .cloned()
        .collect())
}

/// Checks the API server applies that the selector parser does not
fn validate(selector: &LabelSelector) -> Result<(), SelectorError> {
    for (key, value) in selector.match_labels.iter().flatten() {
        validate_key(key)?;
        validate_value(key, value)?;
    }

    for expr in selector.match_expressions.iter().flatten() {
        validate_key(&expr.key)?;
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(SelectorError::MissingValues {
                    key: expr.key.clone(),
                })
            }
            "In" | "NotIn" => {
                for value in values {
                    validate_value(&expr.key, value)?;
                }
            }
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                return Err(SelectorError::UnexpectedValues {
                    key: expr.key.clone(),
                })
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason: &str| SelectorError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > 253 {
                return Err(invalid("prefix must be a DNS subdomain of at most 253 characters"));
            }
            if !prefix
                .split('.')
                .all(|part| !part.is_empty() && is_alnum_dashed(part, &['-']))
            {
                return Err(invalid("prefix must be a DNS subdomain"));
            }
            name
        }
        None => key,
    };

    if name.is_empty() || name.len() > 63 {
        return Err(invalid("name must be 1-63 characters"));
    }
    if !is_alnum_dashed(name, &['-', '_', '.']) {
        return Err(invalid(
            "name must consist of alphanumerics, '-', '_' or '.', starting and ending with an alphanumeric",
        ));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 || !is_alnum_dashed(value, &['-', '_', '.']) {
        return Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Alphanumeric at both ends, alphanumeric or one of `inner` in between
fn is_alnum_dashed(s: &str, inner: &[char]) -> bool {
    let bytes = s.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || inner.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use kube::core::ObjectMeta;
    use mcfg_common::crd::MachineConfigSpec;

    const ROLE: &str = "machineconfiguration.openshift.io/role";

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn role_selector(role: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(&[(ROLE, role)])),
            match_expressions: None,
        }
    }

    fn mc(name: &str, pairs: &[(&str, &str)]) -> Arc<MachineConfig> {
        Arc::new(MachineConfig {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels(pairs)),
                ..Default::default()
            },
            spec: MachineConfigSpec::default(),
        })
    }

    fn expr(key: &str, op: &str, values: Option<&[&str]>) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: values.map(|v| v.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn expressions(exprs: Vec<LabelSelectorRequirement>) -> LabelSelector {
        LabelSelector {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    #[test]
    fn absent_and_empty_selectors_match_nothing() {
        let configs = vec![mc("00-worker", &[(ROLE, "worker")]), mc("unlabeled", &[])];

        assert!(select_machine_configs(None, &configs).unwrap().is_empty());
        assert!(select_machine_configs(Some(&LabelSelector::default()), &configs)
            .unwrap()
            .is_empty());
        assert_eq!(
            PoolSelector::from_field(Some(&LabelSelector::default())).unwrap(),
            PoolSelector::All
        );
        assert_eq!(PoolSelector::from_field(None).unwrap(), PoolSelector::Absent);
    }

    #[test]
    fn match_labels_selects_by_role() {
        let configs = vec![
            mc("00-worker", &[(ROLE, "worker")]),
            mc("00-master", &[(ROLE, "master")]),
            mc("99-worker-ssh", &[(ROLE, "worker"), ("extra", "yes")]),
        ];

        let selected = select_machine_configs(Some(&role_selector("worker")), &configs).unwrap();
        let names: Vec<_> = selected.iter().map(|m| m.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["00-worker", "99-worker-ssh"]);
    }

    #[test]
    fn set_based_expressions() {
        let selector = PoolSelector::from_field(Some(&expressions(vec![
            expr(ROLE, "In", Some(&["worker", "infra"])),
            expr("tier", "NotIn", Some(&["canary"])),
            expr("managed", "Exists", None),
            expr("legacy", "DoesNotExist", None),
        ])))
        .unwrap();

        assert!(selector.matches(&labels(&[(ROLE, "infra"), ("managed", "")])));
        assert!(!selector.matches(&labels(&[(ROLE, "infra"), ("managed", ""), ("tier", "canary")])));
        assert!(!selector.matches(&labels(&[(ROLE, "infra")])));
        assert!(!selector.matches(&labels(&[(ROLE, "worker"), ("managed", "1"), ("legacy", "1")])));
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        let parse = |s: LabelSelector| PoolSelector::from_field(Some(&s));

        assert!(matches!(
            parse(expressions(vec![expr(ROLE, "Equals", Some(&["worker"]))])),
            Err(SelectorError::Parse { .. })
        ));
        assert!(matches!(
            parse(expressions(vec![expr(ROLE, "In", Some(&[]))])),
            Err(SelectorError::MissingValues { .. })
        ));
        assert!(matches!(
            parse(expressions(vec![expr(ROLE, "NotIn", None)])),
            Err(SelectorError::MissingValues { .. })
        ));
        assert!(matches!(
            parse(expressions(vec![expr(ROLE, "Exists", Some(&["worker"]))])),
            Err(SelectorError::UnexpectedValues { .. })
        ));
        assert!(matches!(
            parse(LabelSelector {
                match_labels: Some(labels(&[("-bad", "x")])),
                match_expressions: None,
            }),
            Err(SelectorError::InvalidKey { .. })
        ));
        assert!(matches!(
            parse(role_selector("not a value")),
            Err(SelectorError::InvalidValue { .. })
        ));
    }

    #[test]
    fn display_matches_kubectl_style() {
        let selector = PoolSelector::from_field(Some(&LabelSelector {
            match_labels: Some(labels(&[(ROLE, "worker")])),
            match_expressions: Some(vec![expr("zone", "In", Some(&["a", "b"]))]),
        }))
        .unwrap();
        assert_eq!(
            selector.to_string(),
            "machineconfiguration.openshift.io/role=worker,zone in (a,b)"
        );
    }
}
