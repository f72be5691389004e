//! Versioned config artifacts
//!
//! The fleet config template and each unit's config value are copies of the
//! global sources of one version, stamped with `kunit.dev/config-version`.
//! A version change refreshes the template verbatim and refreshes values
//! without losing per-unit customizations.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use kunit_common::crd::UnitSet;
use kunit_common::ANNOTATION_CONFIG_VERSION;

use crate::template::owned_metadata;

/// What to do with one config artifact
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigAction {
    /// Already at the declared version
    Keep,
    /// Absent, create it
    Create(ConfigMap),
    /// Stale, replace it (carries the live resourceVersion)
    Replace(ConfigMap),
}

/// Version stamped on a config artifact
pub fn config_version(cm: &ConfigMap) -> Option<&str> {
    cm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_CONFIG_VERSION))
        .map(String::as_str)
}

fn stamped(
    us: &UnitSet,
    name: &str,
    version: &str,
    data: Option<BTreeMap<String, String>>,
    source: &ConfigMap,
) -> ConfigMap {
    let mut metadata = owned_metadata(us, name);
    metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_CONFIG_VERSION.to_string(),
        version.to_string(),
    )]));
    ConfigMap {
        metadata,
        data,
        binary_data: source.binary_data.clone(),
        immutable: None,
    }
}

/// Copy of `source` named `name` in the fleet namespace, stamped with `version`
pub fn versioned_copy(us: &UnitSet, name: &str, version: &str, source: &ConfigMap) -> ConfigMap {
    stamped(us, name, version, source.data.clone(), source)
}

/// Plan for the fleet config template: copied verbatim on every version change
pub fn plan_template(
    us: &UnitSet,
    name: &str,
    existing: Option<&ConfigMap>,
    global: &ConfigMap,
) -> ConfigAction {
    let version = us.spec.version.as_str();
    match existing {
        None => ConfigAction::Create(versioned_copy(us, name, version, global)),
        Some(cm) if config_version(cm) == Some(version) => ConfigAction::Keep,
        Some(cm) => {
            let mut fresh = versioned_copy(us, name, version, global);
            fresh.metadata.resource_version = cm.metadata.resource_version.clone();
            ConfigAction::Replace(fresh)
        }
    }
}

/// Customization-preserving merge of a unit's config value.
///
/// An untouched value (equal to the previous global value) becomes the new
/// global value. A customized one keeps every key it has, laid over the new
/// global value. Without the previous global value the unit is assumed
/// customized.
pub fn merge_value(
    unit_data: &BTreeMap<String, String>,
    previous_global: Option<&BTreeMap<String, String>>,
    new_global: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    if previous_global == Some(unit_data) {
        return new_global.clone();
    }
    let mut merged = new_global.clone();
    merged.extend(unit_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Refreshed copy of a stale unit config value
pub fn refreshed_value(
    us: &UnitSet,
    existing: &ConfigMap,
    previous_global: Option<&ConfigMap>,
    new_global: &ConfigMap,
) -> ConfigMap {
    let empty = BTreeMap::new();
    let unit_data = existing.data.as_ref().unwrap_or(&empty);
    let previous = previous_global.map(|cm| cm.data.as_ref().unwrap_or(&empty));
    let new_data = new_global.data.as_ref().unwrap_or(&empty);
    let data = merge_value(unit_data, previous, new_data);

    let name = existing.metadata.name.as_deref().unwrap_or_default();
    let mut fresh = stamped(us, name, &us.spec.version, Some(data), new_global);
    fresh.metadata.resource_version = existing.metadata.resource_version.clone();
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kunit_common::crd::UnitSetSpec;

    fn unitset(version: &str) -> UnitSet {
        let mut us = UnitSet::new(
            "mysql",
            UnitSetSpec {
                type_: "mysql".to_string(),
                version: version.to_string(),
                ..Default::default()
            },
        );
        us.metadata.namespace = Some("db".to_string());
        us.metadata.uid = Some("us-uid".to_string());
        us
    }

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn cm(name: &str, version: Option<&str>, pairs: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("7".to_string()),
                annotations: version.map(|v| {
                    BTreeMap::from([(ANNOTATION_CONFIG_VERSION.to_string(), v.to_string())])
                }),
                ..Default::default()
            },
            data: Some(data(pairs)),
            ..Default::default()
        }
    }

    #[test]
    fn untouched_value_takes_new_global() {
        let old = data(&[("max_connections", "100"), ("buffer", "1G")]);
        let new = data(&[("max_connections", "200"), ("buffer", "1G"), ("ssl", "on")]);
        assert_eq!(merge_value(&old, Some(&old), &new), new);
    }

    #[test]
    fn customized_value_keeps_its_keys() {
        let old = data(&[("max_connections", "100"), ("buffer", "1G")]);
        let unit = data(&[("max_connections", "500"), ("buffer", "1G")]);
        let new = data(&[("max_connections", "200"), ("buffer", "2G"), ("ssl", "on")]);

        let merged = merge_value(&unit, Some(&old), &new);
        assert_eq!(merged["max_connections"], "500");
        // Keys existing on the unit overlay the new global value
        assert_eq!(merged["buffer"], "1G");
        assert_eq!(merged["ssl"], "on");
    }

    #[test]
    fn missing_previous_global_counts_as_customized() {
        let unit = data(&[("max_connections", "100")]);
        let new = data(&[("max_connections", "200"), ("ssl", "on")]);
        let merged = merge_value(&unit, None, &new);
        assert_eq!(merged["max_connections"], "100");
        assert_eq!(merged["ssl"], "on");
    }

    #[test]
    fn template_is_created_kept_or_replaced_by_version() {
        let us = unitset("8.0.41");
        let global = cm("mysql-8.0.41-config-template", None, &[("my.cnf", "v41")]);

        let ConfigAction::Create(created) =
            plan_template(&us, "mysql-config-template", None, &global)
        else {
            panic!("absent template should be created");
        };
        assert_eq!(config_version(&created), Some("8.0.41"));
        assert_eq!(created.metadata.namespace.as_deref(), Some("db"));
        assert_eq!(created.data, global.data);

        let current = cm("mysql-config-template", Some("8.0.41"), &[("my.cnf", "edited")]);
        assert_eq!(
            plan_template(&us, "mysql-config-template", Some(&current), &global),
            ConfigAction::Keep
        );

        let stale = cm("mysql-config-template", Some("8.0.40"), &[("my.cnf", "v40")]);
        let ConfigAction::Replace(replaced) =
            plan_template(&us, "mysql-config-template", Some(&stale), &global)
        else {
            panic!("stale template should be replaced");
        };
        assert_eq!(replaced.data, global.data);
        assert_eq!(replaced.metadata.resource_version.as_deref(), Some("7"));
    }

    #[test]
    fn refreshed_value_is_stamped_with_new_version() {
        let us = unitset("8.0.41");
        let existing = cm("mysql-0-config-value", Some("8.0.40"), &[("server_id", "1")]);
        let previous = cm("mysql-8.0.40-config-value", None, &[("server_id", "0")]);
        let new_global = cm("mysql-8.0.41-config-value", None, &[("server_id", "0"), ("gtid", "on")]);

        let fresh = refreshed_value(&us, &existing, Some(&previous), &new_global);
        assert_eq!(config_version(&fresh), Some("8.0.41"));
        assert_eq!(fresh.metadata.name.as_deref(), Some("mysql-0-config-value"));
        let data = fresh.data.unwrap();
        assert_eq!(data["server_id"], "1");
        assert_eq!(data["gtid"], "on");
    }
}
