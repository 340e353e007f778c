//! End-to-end walk through a personal data vault.
//!
//! Run with: `cargo run --example vault_demo`
//! Set `RUST_LOG=datavault=debug` to see the structured log.
//!
//! - The owner stores a medical record and grants share access to two fields
//! - A clinic submits a signed request, the owner approves one use
//! - The vault packages, signs and delivers the data; the clinic opens it
//! - The audit trail is written to a JSON-lines file

use chrono::Duration;
use datavault::audit::FileAuditSink;
use datavault::keys::SigningKey;
use datavault::package::verify_package_with;
use datavault::permissions::{AccessLevel, Permission};
use datavault::transport::DeliveryOptions;
use datavault::workflow::{ApprovalDecision, ApprovalRestrictions, DataRequest, Requester};
use datavault::{Vault, VaultConfig};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Setup
    let root = std::env::temp_dir().join("datavault_demo");
    let _ = std::fs::remove_dir_all(&root);
    let mut vault = Vault::open(VaultConfig::for_testing(&root), "owner passphrase")?;

    let audit_path = root.join("audit.jsonl");
    vault.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?));

    let session = vault.auth_mut().create_user("owner", "owner passphrase", false)?;

    // 2. Owner data and grant
    vault.store_json(
        "medical",
        "vax-1",
        &json!({
            "patient": {"name": "John Doe"},
            "vaccinations": ["MMR", "Tdap"],
            "diagnoses": ["asthma"],
        }),
    )?;
    vault.grant_permission(
        &session.session_id,
        Permission::new("medical", vec![AccessLevel::Share])
            .with_fields(["patient", "vaccinations"])
            .with_usage_limit(5),
    )?;

    // 3. Clinic request, signed with the clinic's key
    let clinic_key = SigningKey::generate()?;
    let mut request = DataRequest::new(
        "req-001",
        Requester::new("clinic-7", "Northside Clinic").with_organization("Northside Health"),
        "medical",
        ["patient", "vaccinations"],
        "school enrolment",
        Duration::hours(24),
    )?;
    request.sign(&clinic_key)?;
    vault.submit_request(request)?;

    // 4. Owner approves a single use for this clinic
    let restrictions = ApprovalRestrictions::default()
        .max_uses(1)
        .allowed_recipients(["clinic-7"]);
    vault.approve_request(
        &session.session_id,
        "req-001",
        ApprovalDecision::approve(Some(restrictions)),
    )?;

    // 5. Fulfil and deliver
    let fulfillment = vault.fulfill_request(
        &session.session_id,
        "req-001",
        "vax-1",
        "clinic-7",
        DeliveryOptions::portal(),
    )?;
    println!("Access URL: {}", fulfillment.delivery.access_url);
    println!(
        "Signature valid: {}",
        verify_package_with(&vault.public_key(), &fulfillment.package)
    );

    // 6. Clinic opens the package
    let payload = vault.open_delivery(
        &fulfillment.delivery.token_id,
        &fulfillment.delivery.access_key,
        &fulfillment.package,
        &fulfillment.package_key,
    )?;
    println!("Received: {payload}");

    println!("Audit log: {} records", vault.audit_log().len());
    println!("Audit file: {}", audit_path.display());

    Ok(())
}
