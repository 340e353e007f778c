use chrono::{DateTime, Duration, Utc};
use datavault::permissions::{
    AccessContext, AccessDecision, AccessLevel, DenyReason, Permission, PermissionEngine,
};
use datavault::VaultConfig;

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_evaluation_order() {
    // Goal: each stage denies with its own reason, in order.
    let mut engine = PermissionEngine::in_memory();
    assert_eq!(
        engine.check_permission("owner", "medical", &[], AccessLevel::Read, None),
        AccessDecision::Denied(DenyReason::NoPermissions)
    );

    engine
        .grant(
            "owner",
            Permission::new("medical", vec![AccessLevel::Read]).with_fields(["vaccinations"]),
        )
        .unwrap();

    assert_eq!(
        engine.check_permission("owner", "financial", &[], AccessLevel::Read, None),
        AccessDecision::Denied(DenyReason::CategoryNotGranted("financial".into()))
    );
    assert_eq!(
        engine.check_permission("owner", "medical", &[], AccessLevel::Share, None),
        AccessDecision::Denied(DenyReason::LevelNotGranted(AccessLevel::Share))
    );
    assert_eq!(
        engine.check_permission(
            "owner",
            "medical",
            &fields(&["vaccinations", "diagnoses", "ssn"]),
            AccessLevel::Read,
            None,
        ),
        AccessDecision::Denied(DenyReason::FieldsNotPermitted(fields(&["diagnoses", "ssn"])))
    );
    assert!(engine
        .check_permission("owner", "medical", &fields(&["vaccinations"]), AccessLevel::Read, None)
        .is_allowed());
}

#[test]
fn test_time_window() {
    let now = Utc::now();
    let mut engine = PermissionEngine::in_memory();
    engine
        .grant(
            "owner",
            Permission::new("identity", vec![AccessLevel::Read])
                .valid_between(Some(now), Some(now + Duration::days(1))),
        )
        .unwrap();

    let check = |at: DateTime<Utc>| {
        engine.check_permission_at("owner", "identity", &[], AccessLevel::Read, None, at)
    };
    assert_eq!(
        check(now - Duration::minutes(1)),
        AccessDecision::Denied(DenyReason::NotYetValid)
    );
    assert!(check(now + Duration::hours(1)).is_allowed());

    let expired = check(now + Duration::days(2));
    assert_eq!(expired, AccessDecision::Denied(DenyReason::Expired));
    assert_eq!(
        expired.into_result().unwrap_err().kind(),
        datavault::ErrorKind::Expired
    );
}

#[test]
fn test_usage_limit_counts_recorded_uses() {
    let mut engine = PermissionEngine::in_memory();
    engine
        .grant(
            "owner",
            Permission::new("financial", vec![AccessLevel::Share]).with_usage_limit(2),
        )
        .unwrap();

    for expected in 1..=2 {
        assert!(engine
            .check_permission("owner", "financial", &[], AccessLevel::Share, None)
            .is_allowed());
        assert_eq!(engine.record_usage("owner", "financial").unwrap(), Some(expected));
    }
    assert_eq!(
        engine.check_permission("owner", "financial", &[], AccessLevel::Share, None),
        AccessDecision::Denied(DenyReason::UsageLimitReached)
    );
}

#[test]
fn test_context_conditions_only_checked_when_supplied() {
    let mut engine = PermissionEngine::in_memory();
    engine
        .grant(
            "owner",
            Permission::new("employment", vec![AccessLevel::Share])
                .for_recipients(["acme-hr"])
                .for_purposes(["background check"]),
        )
        .unwrap();

    // No context: recipient and purpose checks are skipped.
    assert!(engine
        .check_permission("owner", "employment", &[], AccessLevel::Share, None)
        .is_allowed());

    let wrong_recipient = AccessContext {
        recipient: Some("data-broker".into()),
        purpose: Some("background check".into()),
    };
    assert_eq!(
        engine.check_permission("owner", "employment", &[], AccessLevel::Share, Some(&wrong_recipient)),
        AccessDecision::Denied(DenyReason::RecipientNotAllowed("data-broker".into()))
    );

    let wrong_purpose = AccessContext {
        recipient: Some("acme-hr".into()),
        purpose: Some("marketing".into()),
    };
    assert_eq!(
        engine.check_permission("owner", "employment", &[], AccessLevel::Share, Some(&wrong_purpose)),
        AccessDecision::Denied(DenyReason::PurposeNotAllowed("marketing".into()))
    );

    let purpose_only = AccessContext {
        recipient: None,
        purpose: Some("background check".into()),
    };
    assert!(engine
        .check_permission("owner", "employment", &[], AccessLevel::Share, Some(&purpose_only))
        .is_allowed());
}

#[test]
fn test_grants_and_usage_persist() {
    let dir = tempfile::tempdir().unwrap();
    let config = VaultConfig::for_testing(dir.path());
    {
        let mut engine = PermissionEngine::open(&config).unwrap();
        engine
            .grant(
                "owner",
                Permission::new("medical", vec![AccessLevel::Share]).with_usage_limit(1),
            )
            .unwrap();
        engine.record_usage("owner", "medical").unwrap();
    }

    let engine = PermissionEngine::open(&config).unwrap();
    assert_eq!(engine.permissions_for("owner").len(), 1);
    assert_eq!(
        engine.check_permission("owner", "medical", &[], AccessLevel::Share, None),
        AccessDecision::Denied(DenyReason::UsageLimitReached)
    );
}
