//! Unit tests for Etcd spec validation

use etcd_druid::controller::Error;
use etcd_druid::controller::ownership::{Ownership, check_statefulset_selector, selector_compatible};
use etcd_druid::controller::validation::{validate_selector_unchanged, validate_spec};
use etcd_druid::resources;
use serde_json::json;

use crate::common::*;

fn rejection(etcd: &etcd_druid::crd::Etcd) -> String {
    match validate_spec(etcd) {
        Err(Error::ValidationError(message)) => message,
        other => panic!("expected a validation error, got {:?}", other),
    }
}

mod spec_tests {
    use super::*;

    #[test]
    fn test_fixture_is_valid() {
        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_replicas(3)
            .with_tls()
            .with_backup_store()
            .build();
        assert!(validate_spec(&etcd).is_ok());
    }

    #[test]
    fn test_replicas_must_be_positive() {
        let etcd = create_test_etcd("etcd-main", "default", 0);
        assert!(rejection(&etcd).contains("replica count 0"));
    }

    #[test]
    fn test_selector_must_be_covered_by_labels() {
        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_selector_label("tier", "control-plane")
            .build();
        assert!(rejection(&etcd).contains("tier=control-plane is missing"));

        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_selector_label("app", "other")
            .build();
        assert!(rejection(&etcd).contains("does not match labels"));
    }

    #[test]
    fn test_empty_selector_is_rejected() {
        let mut etcd = create_test_etcd("etcd-main", "default", 1);
        etcd.spec.selector.match_labels = None;
        assert!(rejection(&etcd).contains("must not be empty"));
    }

    #[test]
    fn test_ports_must_be_distinct_and_in_range() {
        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_spec_field("backup", "port", json!(2379))
            .build();
        assert!(rejection(&etcd).contains("must differ"));

        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_spec_field("etcd", "serverPort", json!(70000))
            .build();
        assert!(rejection(&etcd).contains("out of range"));
    }

    #[test]
    fn test_quantities_schedules_and_durations() {
        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_spec_field("etcd", "quota", json!("0"))
            .build();
        assert!(rejection(&etcd).contains("etcd.quota"));

        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_spec_field("backup", "fullSnapshotSchedule", json!("@hourly"))
            .build();
        assert!(rejection(&etcd).contains("cron"));

        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_spec_field("backup", "deltaSnapshotPeriod", json!("soon"))
            .build();
        assert!(rejection(&etcd).contains("not a duration"));
    }

    #[test]
    fn test_backup_store_needs_a_prefix() {
        let mut etcd = EtcdBuilder::new("etcd-main", "default")
            .with_backup_store()
            .build();
        etcd.spec.backup.store.as_mut().unwrap().prefix = String::new();
        assert!(rejection(&etcd).contains("prefix"));

        let etcd = EtcdBuilder::new("etcd-main", "default")
            .with_spec_field("backup", "maxBackups", json!(0))
            .build();
        assert!(rejection(&etcd).contains("maxBackups"));
    }

    #[test]
    fn test_validation_errors_are_not_retried() {
        let err = validate_spec(&create_test_etcd("etcd-main", "default", 0)).unwrap_err();
        assert!(!err.is_retryable());
    }
}

mod selector_tests {
    use super::*;

    #[test]
    fn test_selector_cannot_change_once_the_statefulset_exists() {
        let etcd = create_test_etcd("etcd-main", "default", 3);
        let sts = resources::build(&etcd)
            .unwrap()
            .statefulset()
            .unwrap()
            .clone();
        assert!(validate_selector_unchanged(&etcd, &sts).is_ok());

        let changed = EtcdBuilder::new("etcd-main", "default")
            .with_label("tier", "main")
            .with_selector_label("tier", "main")
            .build();
        assert!(validate_spec(&changed).is_ok());
        let err = validate_selector_unchanged(&changed, &sts).unwrap_err();
        assert!(err.to_string().contains("selector is immutable"));
    }
}

mod selector_compatibility_tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_wider_selector_within_the_pod_labels_is_accepted() {
        let etcd = create_test_etcd("etcd-main", "default", 1);
        let wider = labels(&[
            ("app", "etcd-statefulset"),
            ("role", "test"),
            ("instance", "etcd-main"),
        ]);
        assert!(selector_compatible(&etcd, &wider));

        let sts = unowned_statefulset(&etcd, wider);
        assert!(validate_selector_unchanged(&etcd, &sts).is_ok());
        assert_eq!(
            check_statefulset_selector(&etcd, &serde_json::to_value(&sts).unwrap()),
            Ownership::Adoptable
        );
    }

    #[test]
    fn test_selector_outside_the_pod_labels_is_refused_by_both() {
        let etcd = create_test_etcd("etcd-main", "default", 1);
        let blue = labels(&[
            ("app", "etcd-statefulset"),
            ("instance", "etcd-main"),
            ("tier", "blue"),
        ]);
        assert!(!selector_compatible(&etcd, &blue));

        let sts = unowned_statefulset(&etcd, blue);
        let err = validate_selector_unchanged(&etcd, &sts).unwrap_err();
        assert!(err.to_string().contains("selector is immutable"));
        assert!(matches!(
            check_statefulset_selector(&etcd, &serde_json::to_value(&sts).unwrap()),
            Ownership::Foreign(reason) if reason.contains("selector")
        ));

        // Narrower than the Etcd's own selector
        let narrow = labels(&[("app", "etcd-statefulset")]);
        assert!(!selector_compatible(&etcd, &narrow));
    }

    #[test]
    fn test_match_expressions_are_never_adopted() {
        let etcd = create_test_etcd("etcd-main", "default", 1);
        let mut sts = serde_json::to_value(unowned_statefulset(
            &etcd,
            labels(&[("app", "etcd-statefulset"), ("instance", "etcd-main")]),
        ))
        .unwrap();
        sts["spec"]["selector"]["matchExpressions"] =
            json!([{"key": "tier", "operator": "Exists"}]);
        assert!(matches!(
            check_statefulset_selector(&etcd, &sts),
            Ownership::Foreign(reason) if reason.contains("matchExpressions")
        ));
    }
}
