//! Namespace reconcile phase support: translating the CRD's retention representation into the
//! admin API's wire shape, and diffing desired against observed namespaces.
use crate::crd::{NamespaceOptionsSpec, NamespaceRetention, NamespaceSpec as CrdNamespaceSpec};
use crate::error::{Error, Result};

use m3dbop_admin_client::model::{IndexOptions, NamespaceOptions, NamespaceSpec, RetentionOptions};

/// Built-in resolution:retention presets, named the way M3DB's own example configs name them
/// (e.g. `"10s:2d"` = 10s block size, 2 day retention). Index block size and write-indexing
/// default to the block size and `true` respectively; buffer past/future take M3DB's own
/// defaults (10m/20m).
fn preset_options(preset: &str) -> Result<NamespaceOptionsSpec> {
    let (block_size, retention_period) = preset
        .split_once(':')
        .ok_or_else(|| Error::Validation(format!("unrecognized namespace preset {preset:?}, expected \"<blockSize>:<retentionPeriod>\"")))?;
    Ok(NamespaceOptionsSpec {
        retention_period: retention_period.to_string(),
        block_size: block_size.to_string(),
        index_block_size: block_size.to_string(),
        buffer_past: "10m".to_string(),
        buffer_future: "20m".to_string(),
        write_index_enabled: true,
    })
}

fn parse_duration_nanos(field: &'static str, duration: &str) -> Result<i64> {
    humantime::parse_duration(duration)
        .map_err(|e| Error::Validation(format!("invalid {field} {duration:?}: {e}")))?
        .as_nanos()
        .try_into()
        .map_err(|_| Error::Validation(format!("{field} {duration:?} overflows i64 nanoseconds")))
}

/// Resolve a CRD namespace's retention (preset or explicit options) into the admin API's
/// `NamespaceOptions`. Fails with `Error::Validation` when neither or both of `preset`/`options`
/// are set, or when a duration string doesn't parse.
pub fn resolve_options(ns: &CrdNamespaceSpec) -> Result<NamespaceOptions> {
    let retention = ns.retention().ok_or_else(|| {
        Error::Validation(format!(
            "namespace {:?} must set exactly one of preset/options",
            ns.name
        ))
    })?;
    let owned;
    let options = match retention {
        NamespaceRetention::Preset(p) => {
            owned = preset_options(p)?;
            &owned
        }
        NamespaceRetention::Options(o) => o,
    };

    Ok(NamespaceOptions {
        retention: RetentionOptions {
            retention_period_nanos: parse_duration_nanos("retentionPeriod", &options.retention_period)?,
            block_size_nanos: parse_duration_nanos("blockSize", &options.block_size)?,
            buffer_past_nanos: parse_duration_nanos("bufferPast", &options.buffer_past)?,
            buffer_future_nanos: parse_duration_nanos("bufferFuture", &options.buffer_future)?,
        },
        index: IndexOptions {
            enabled: options.write_index_enabled,
            block_size_nanos: parse_duration_nanos("indexBlockSize", &options.index_block_size)?,
        },
        writes_to_commit_log: true,
    })
}

pub fn to_admin_spec(ns: &CrdNamespaceSpec) -> Result<NamespaceSpec> {
    Ok(NamespaceSpec {
        name: ns.name.clone(),
        options: resolve_options(ns)?,
    })
}

/// A single namespace-phase action: at most one of these is applied per reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub enum NamespaceAction {
    Create(NamespaceSpec),
    Delete(String),
}

/// Diff desired namespaces against the coordinator's observed set. A name present in both with
/// matching options needs no action; a mismatch is surfaced as `NamespaceImmutable` rather than
/// an action: namespaces are never silently mutated after creation.
pub fn plan_namespace_action(
    desired: &[CrdNamespaceSpec],
    observed: &std::collections::BTreeMap<String, NamespaceOptions>,
) -> Result<(Option<NamespaceAction>, Vec<String>)> {
    let mut immutable_mismatches = Vec::new();

    for ns in desired {
        if !observed.contains_key(&ns.name) {
            return Ok((Some(NamespaceAction::Create(to_admin_spec(ns)?)), immutable_mismatches));
        }
    }

    for (name, existing_options) in observed {
        if !desired.iter().any(|ns| &ns.name == name) {
            return Ok((Some(NamespaceAction::Delete(name.clone())), immutable_mismatches));
        }
    }

    for ns in desired {
        if let Some(existing) = observed.get(&ns.name) {
            let resolved = resolve_options(ns)?;
            if &resolved != existing {
                immutable_mismatches.push(ns.name.clone());
            }
        }
    }

    Ok((None, immutable_mismatches))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn explicit_ns(name: &str) -> CrdNamespaceSpec {
        CrdNamespaceSpec {
            name: name.to_string(),
            preset: None,
            options: Some(NamespaceOptionsSpec {
                retention_period: "48h".to_string(),
                block_size: "2h".to_string(),
                index_block_size: "2h".to_string(),
                buffer_past: "10m".to_string(),
                buffer_future: "20m".to_string(),
                write_index_enabled: true,
            }),
        }
    }

    #[test]
    fn test_resolve_options_from_explicit_options() {
        let ns = explicit_ns("metrics");
        let resolved = resolve_options(&ns).unwrap();
        assert_eq!(resolved.retention.retention_period_nanos, 48 * 3600 * 1_000_000_000);
        assert_eq!(resolved.retention.block_size_nanos, 2 * 3600 * 1_000_000_000);
    }

    #[test]
    fn test_resolve_options_from_preset() {
        let ns = CrdNamespaceSpec {
            name: "metrics".to_string(),
            preset: Some("10s:2d".to_string()),
            options: None,
        };
        let resolved = resolve_options(&ns).unwrap();
        assert_eq!(resolved.retention.retention_period_nanos, 2 * 86400 * 1_000_000_000);
        assert_eq!(resolved.retention.block_size_nanos, 10 * 1_000_000_000);
    }

    #[test]
    fn test_resolve_options_rejects_both_preset_and_options_set() {
        let mut ns = explicit_ns("metrics");
        ns.preset = Some("10s:2d".to_string());
        assert!(resolve_options(&ns).is_err());
    }

    #[test]
    fn test_plan_namespace_action_creates_missing_namespace() {
        let desired = vec![explicit_ns("metrics")];
        let observed = BTreeMap::new();
        let (action, mismatches) = plan_namespace_action(&desired, &observed).unwrap();
        assert!(matches!(action, Some(NamespaceAction::Create(spec)) if spec.name == "metrics"));
        assert!(mismatches.is_empty());
    }

    #[test]
    fn test_plan_namespace_action_deletes_undesired_namespace() {
        let ns = explicit_ns("metrics");
        let options = resolve_options(&ns).unwrap();
        let mut observed = BTreeMap::new();
        observed.insert("metrics".to_string(), options);
        let (action, _) = plan_namespace_action(&[], &observed).unwrap();
        assert_eq!(action, Some(NamespaceAction::Delete("metrics".to_string())));
    }

    #[test]
    fn test_plan_namespace_action_flags_mismatch_as_immutable() {
        let ns = explicit_ns("metrics");
        let mut mismatched = resolve_options(&ns).unwrap();
        mismatched.retention.retention_period_nanos += 1;
        let mut observed = BTreeMap::new();
        observed.insert("metrics".to_string(), mismatched);
        let (action, mismatches) = plan_namespace_action(&[ns], &observed).unwrap();
        assert!(action.is_none());
        assert_eq!(mismatches, vec!["metrics".to_string()]);
    }

    #[test]
    fn test_plan_namespace_action_no_op_when_matching() {
        let ns = explicit_ns("metrics");
        let options = resolve_options(&ns).unwrap();
        let mut observed = BTreeMap::new();
        observed.insert("metrics".to_string(), options);
        let (action, mismatches) = plan_namespace_action(&[ns], &observed).unwrap();
        assert!(action.is_none());
        assert!(mismatches.is_empty());
    }
}
