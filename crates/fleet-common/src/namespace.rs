//! System and registration namespace derivation
//!
//! Agents register in a namespace separate from the one the controller runs
//! in. Its name is derived from the system namespace so both sides agree
//! without extra configuration.

const SYSTEM_SUFFIX: &str = "-system";

/// Suffix identifying the registration namespace
pub const REGISTRATION_SUFFIX: &str = "-clusters-system";

/// Derive the registration namespace from the system namespace.
///
/// Every `-system` in the name is replaced by `-clusters-system`. Names
/// without `-system` get the suffix appended. Never fails; the empty
/// string yields `-clusters-system`.
pub fn registration_namespace(system_namespace: &str) -> String {
    let derived = system_namespace.replace(SYSTEM_SUFFIX, REGISTRATION_SUFFIX);
    if derived == system_namespace {
        format!("{system_namespace}{REGISTRATION_SUFFIX}")
    } else {
        derived
    }
}

/// The namespace pair every control loop is registered with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespaces {
    system: String,
    registration: String,
}

impl Namespaces {
    /// Build the pair from the configured system namespace
    pub fn new(system: impl Into<String>) -> Self {
        let system = system.into();
        let registration = registration_namespace(&system);
        Self {
            system,
            registration,
        }
    }

    /// Namespace the controller and its configuration live in
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Namespace agents register in
    pub fn registration(&self) -> &str {
        &self.registration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_namespace_maps_to_clusters_system() {
        assert_eq!(
            registration_namespace("cattle-fleet-system"),
            "cattle-fleet-clusters-system"
        );
    }

    #[test]
    fn names_without_system_get_suffix_appended() {
        assert_eq!(registration_namespace("fleet"), "fleet-clusters-system");
        assert_eq!(registration_namespace(""), "-clusters-system");
    }

    #[test]
    fn bare_suffix_is_replaced() {
        assert_eq!(registration_namespace("-system"), "-clusters-system");
    }

    #[test]
    fn every_occurrence_is_replaced() {
        assert_eq!(
            registration_namespace("a-system-b-system"),
            "a-clusters-system-b-clusters-system"
        );
    }

    #[test]
    fn derivation_never_returns_input() {
        for ns in ["", "fleet", "-system", "x-system", "my-system-ns", "system"] {
            let derived = registration_namespace(ns);
            assert_ne!(derived, ns);
            assert!(derived.contains(REGISTRATION_SUFFIX));
        }
    }

    #[test]
    fn single_occurrence_replacement_holds() {
        for ns in ["cattle-fleet-system", "a-system", "-system-b", "x-system-y"] {
            let expected = ns.replacen(SYSTEM_SUFFIX, REGISTRATION_SUFFIX, 1);
            assert_eq!(registration_namespace(ns), expected);
        }
    }

    #[test]
    fn namespaces_pair_is_consistent() {
        let ns = Namespaces::new("cattle-fleet-system");
        assert_eq!(ns.system(), "cattle-fleet-system");
        assert_eq!(ns.registration(), "cattle-fleet-clusters-system");
    }
}
