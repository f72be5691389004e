//! Deterministic names for everything derived from a UnitSet

/// Name of the Unit with the given ordinal
pub fn unit_name(unitset: &str, ordinal: u32) -> String {
    format!("{}-{}", unitset, ordinal)
}

/// Expected Unit names for `replicas` ordinals, ascending
pub fn unit_names(unitset: &str, replicas: u32) -> Vec<String> {
    (0..replicas).map(|i| unit_name(unitset, i)).collect()
}

fn family(type_: &str, edition: Option<&str>, version: &str) -> String {
    match edition.filter(|e| !e.is_empty()) {
        Some(edition) => format!("{}-{}-{}", type_, edition, version),
        None => format!("{}-{}", type_, version),
    }
}

/// Global config template for a type/edition/version
pub fn global_config_template(type_: &str, edition: Option<&str>, version: &str) -> String {
    format!("{}-config-template", family(type_, edition, version))
}

/// Global config value template for a type/edition/version
pub fn global_config_value(type_: &str, edition: Option<&str>, version: &str) -> String {
    format!("{}-config-value", family(type_, edition, version))
}

/// Golden pod template for a type/edition/version
pub fn global_pod_template(type_: &str, edition: Option<&str>, version: &str) -> String {
    format!("{}-pod-template", family(type_, edition, version))
}

/// Fleet copy of the config template
pub fn unitset_config_template(unitset: &str) -> String {
    format!("{}-config-template", unitset)
}

/// Fleet copy of the golden pod template
pub fn unitset_pod_template(unitset: &str) -> String {
    format!("{}-pod-template", unitset)
}

/// Per-unit config value
pub fn unit_config_value(unit: &str) -> String {
    format!("{}-config-value", unit)
}

/// Headless service shared by the fleet
pub fn headless_service(unitset: &str) -> String {
    format!("{}-headless-svc", unitset)
}

/// External service of the fleet
pub fn external_service(unitset: &str) -> String {
    format!("{}-svc", unitset)
}

/// Per-unit service
pub fn unit_service(unit: &str) -> String {
    format!("{}-svc", unit)
}

/// ServiceAccount (and Role/RoleBinding) of the fleet
pub fn service_account(unitset: &str) -> String {
    format!("{}-sa", unitset)
}

/// Per-unit cert-manager Issuer
pub fn unit_issuer(unit: &str) -> String {
    format!("{}-issuer", unit)
}

/// Per-unit cert-manager Certificate (also its Secret)
pub fn unit_certificate(unit: &str) -> String {
    format!("{}-certificate", unit)
}

/// PersistentVolumeClaim created from a claim template
pub fn claim_name(template: &str, unit: &str) -> String {
    format!("{}-{}", template, unit)
}
