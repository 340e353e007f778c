//! The vault facade.
//!
//! Owns every component and runs the cross-component flows: session-gated
//! owner decisions, request fulfillment (approval, permission, package,
//! delivery) and recipient-side opening of a delivered package.

use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditLog, AuditSink};
use crate::auth::{AuthManager, AuthSession};
use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::keys::{PackageKey, SigningKey, SymmetricKey};
use crate::package::{DataPackage, DataPackager, PackageOptions};
use crate::permissions::{AccessContext, AccessLevel, Permission, PermissionEngine};
use crate::persist;
use crate::store::{DocumentMetadata, DocumentStore, DocumentSummary, SealedBlob};
use crate::transport::{Delivery, DeliveryOptions, SecureTransport};
use crate::workflow::{ApprovalDecision, ApprovalStatus, ApprovalWorkflow, DataApproval, DataRequest};

const OWNER: &str = "owner";
const SIGNING_KEY_AAD: &[u8] = b"datavault signing key";

/// Everything a fulfilled request produces for the owner to hand over.
#[derive(Debug, Clone)]
pub struct Fulfillment {
    pub package: DataPackage,
    /// Decrypts `package`. Send out of band, never with the access URL.
    pub package_key: PackageKey,
    pub delivery: Delivery,
}

/// Counts from one [`Vault::cleanup`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions: usize,
    pub approvals: usize,
    pub tokens: usize,
}

#[derive(Debug)]
pub struct Vault {
    config: VaultConfig,
    store: DocumentStore,
    auth: AuthManager,
    permissions: PermissionEngine,
    workflow: ApprovalWorkflow,
    packager: DataPackager,
    transport: SecureTransport,
    audit: AuditLog,
}

impl Vault {
    /// Open (or create) the vault under `config.root`.
    ///
    /// Derives the master key from `passphrase`, unseals the signing key
    /// (minting one on first open) and loads auth, permission, workflow and
    /// access-token state.
    pub fn open(config: VaultConfig, passphrase: &str) -> VaultResult<Self> {
        config.validate()?;
        persist::ensure_dir(&config.root)?;

        let mut store = DocumentStore::new(&config);
        store.initialize(passphrase)?;
        let signing_key = load_signing_key(&store, &config)?;
        let token_key = store.derive_purpose_key("access-tokens")?;

        let vault = Self {
            auth: AuthManager::open(&config)?,
            permissions: PermissionEngine::open(&config)?,
            workflow: ApprovalWorkflow::open(&config)?,
            packager: DataPackager::new(signing_key).with_default_ttl(config.package_ttl()?),
            transport: SecureTransport::open(&config, token_key)?,
            audit: AuditLog::new(),
            store,
            config,
        };
        info!(root = %vault.config.root.display(), "vault opened");
        Ok(vault)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn auth_mut(&mut self) -> &mut AuthManager {
        &mut self.auth
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn workflow(&self) -> &ApprovalWorkflow {
        &self.workflow
    }

    pub fn packager(&self) -> &DataPackager {
        &self.packager
    }

    pub fn transport(&self) -> &SecureTransport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut SecureTransport {
        &mut self.transport
    }

    /// Base64 Ed25519 key recipients verify packages against.
    pub fn public_key(&self) -> String {
        self.packager.public_key()
    }

    pub fn add_audit_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.audit.add_forward_sink(sink);
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    fn session(&self, session_id: &str) -> VaultResult<AuthSession> {
        self.auth.validate_session(session_id)
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub fn store_document(
        &mut self,
        category: &str,
        id: &str,
        plaintext: &[u8],
    ) -> VaultResult<DocumentMetadata> {
        let metadata = self.store.store_document(category, id, plaintext)?;
        self.audit
            .record(AuditAction::DocumentStored, OWNER, &format!("{category}/{id}"));
        Ok(metadata)
    }

    pub fn store_json(
        &mut self,
        category: &str,
        id: &str,
        value: &Value,
    ) -> VaultResult<DocumentMetadata> {
        let bytes = Zeroizing::new(serde_json::to_vec(value)?);
        self.store_document(category, id, &bytes)
    }

    pub fn retrieve_document(&mut self, category: &str, id: &str) -> VaultResult<Vec<u8>> {
        let plaintext = self.store.retrieve_document(category, id)?;
        self.audit
            .record(AuditAction::DocumentRetrieved, OWNER, &format!("{category}/{id}"));
        Ok(plaintext)
    }

    pub fn retrieve_json(&mut self, category: &str, id: &str) -> VaultResult<Value> {
        let bytes = Zeroizing::new(self.retrieve_document(category, id)?);
        serde_json::from_slice(&bytes)
            .map_err(|_| VaultError::validation(format!("document {category}/{id} is not JSON")))
    }

    pub fn list_documents(&self, category: &str) -> VaultResult<Vec<DocumentSummary>> {
        self.store.list_documents(category)
    }

    pub fn delete_document(&mut self, category: &str, id: &str) -> VaultResult<()> {
        self.store.delete_document(category, id)?;
        self.audit
            .record(AuditAction::DocumentDeleted, OWNER, &format!("{category}/{id}"));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Workflow
    // -----------------------------------------------------------------------

    pub fn submit_request(&mut self, request: DataRequest) -> VaultResult<DataApproval> {
        let requester = request.requester.id.clone();
        let approval = self.workflow.submit_request(request)?;
        self.audit
            .record(AuditAction::RequestSubmitted, &requester, &approval.request_id);
        Ok(approval)
    }

    pub fn approve_request(
        &mut self,
        session_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> VaultResult<DataApproval> {
        let session = self.session(session_id)?;
        let approval = self
            .workflow
            .approve_request(request_id, &session.user_id, decision)?;
        let action = match approval.status {
            ApprovalStatus::Approved => AuditAction::RequestApproved,
            _ => AuditAction::RequestRejected,
        };
        self.audit.record(action, &session.user_id, request_id);
        Ok(approval)
    }

    pub fn reject_request(
        &mut self,
        session_id: &str,
        request_id: &str,
        reason: &str,
    ) -> VaultResult<DataApproval> {
        self.approve_request(session_id, request_id, ApprovalDecision::reject(reason))
    }

    pub fn revoke_approval(
        &mut self,
        session_id: &str,
        request_id: &str,
        reason: &str,
    ) -> VaultResult<DataApproval> {
        let session = self.session(session_id)?;
        let approval = self
            .workflow
            .revoke_approval(request_id, &session.user_id, reason)?;
        self.audit
            .record(AuditAction::ApprovalRevoked, &session.user_id, request_id);
        Ok(approval)
    }

    // -----------------------------------------------------------------------
    // Permissions
    // -----------------------------------------------------------------------

    /// Grant the session's user a permission.
    pub fn grant_permission(&mut self, session_id: &str, permission: Permission) -> VaultResult<()> {
        let session = self.session(session_id)?;
        let category = permission.category.clone();
        self.permissions.grant(&session.user_id, permission)?;
        self.audit
            .record(AuditAction::PermissionGranted, &session.user_id, &category);
        Ok(())
    }

    pub fn revoke_permission(&mut self, session_id: &str, category: &str) -> VaultResult<bool> {
        let session = self.session(session_id)?;
        let removed = self.permissions.revoke(&session.user_id, category)?;
        if removed {
            self.audit
                .record(AuditAction::PermissionRevoked, &session.user_id, category);
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Fulfillment
    // -----------------------------------------------------------------------

    /// Why an approval cannot be fulfilled, as an error.
    fn unfulfillable(&self, request_id: &str) -> VaultError {
        match self.workflow.get_approval(request_id) {
            None => VaultError::not_found("approval", request_id),
            // An approved record that fails the check has lapsed.
            Some(a) if matches!(a.status, ApprovalStatus::Expired | ApprovalStatus::Approved) => {
                VaultError::Expired(format!("approval {request_id}"))
            }
            Some(a) => VaultError::StateConflict(format!("request {request_id} is {}", a.status)),
        }
    }

    /// Package the document for an approved request and deliver it.
    ///
    /// Both the approval restrictions and the owner's permission grant must
    /// allow the access. A use is consumed on each only after delivery
    /// succeeds; if either count cannot be recorded, the earlier steps are
    /// undone and the access token withdrawn.
    pub fn fulfill_request(
        &mut self,
        session_id: &str,
        request_id: &str,
        document_id: &str,
        recipient: &str,
        delivery: DeliveryOptions,
    ) -> VaultResult<Fulfillment> {
        let session = self.session(session_id)?;
        let owner = session.user_id.as_str();

        if !self.workflow.can_fulfill_request(request_id) {
            return Err(self.unfulfillable(request_id));
        }
        if !self.workflow.is_recipient_allowed(request_id, recipient)? {
            warn!(request_id, recipient, "recipient not on approval allow-list");
            return Err(VaultError::AuthFailure(format!(
                "recipient {recipient} not allowed for request {request_id}"
            )));
        }
        let request = self
            .workflow
            .get_request(request_id)
            .cloned()
            .ok_or_else(|| VaultError::not_found("request", request_id))?;

        let context = AccessContext {
            recipient: Some(recipient.to_string()),
            purpose: Some(request.purpose.clone()),
        };
        self.permissions
            .check_permission(
                owner,
                &request.category,
                &request.fields,
                AccessLevel::Share,
                Some(&context),
            )
            .into_result()?;

        let bytes = Zeroizing::new(self.retrieve_document(&request.category, document_id)?);
        let data: Value = serde_json::from_slice(&bytes).map_err(|_| {
            VaultError::validation(format!(
                "document {}/{document_id} is not JSON",
                request.category
            ))
        })?;

        let (package, package_key) = self.packager.create_package(
            request_id,
            recipient,
            &request.category,
            &request.fields,
            &data,
            PackageOptions::default(),
        )?;
        self.audit
            .record(AuditAction::PackageCreated, owner, &package.package_id);

        let delivery = self.transport.deliver_package(&package, delivery)?;
        self.audit
            .record(AuditAction::PackageDelivered, recipient, &package.package_id);

        if let Err(err) = self.workflow.record_fulfillment(request_id) {
            self.withdraw_token(&delivery.token_id);
            return Err(err);
        }
        if let Err(err) = self.permissions.record_usage(owner, &request.category) {
            if let Err(undo) = self.workflow.release_fulfillment(request_id) {
                warn!(request_id, error = %undo, "could not release approval use");
            }
            self.withdraw_token(&delivery.token_id);
            return Err(err);
        }

        info!(
            request_id,
            package_id = %package.package_id,
            token_id = %delivery.token_id,
            "request fulfilled"
        );
        Ok(Fulfillment {
            package,
            package_key,
            delivery,
        })
    }

    fn withdraw_token(&mut self, token_id: &str) {
        if let Err(err) = self.transport.revoke_access_token(token_id) {
            warn!(token_id, error = %err, "could not withdraw access token");
        }
    }

    /// Recipient side: redeem an access token and decrypt its package.
    ///
    /// The caller must present the token's `access_key` as handed over in
    /// [`Delivery`]. One-time tokens are consumed on success.
    pub fn open_delivery(
        &mut self,
        token_id: &str,
        access_key: &SymmetricKey,
        package: &DataPackage,
        package_key: &PackageKey,
    ) -> VaultResult<Value> {
        let token = self.transport.authorize_access(token_id, access_key)?;
        if token.package_id != package.package_id {
            return Err(VaultError::validation("access token does not match package"));
        }
        let one_time_use = token.one_time_use;
        let recipient = token.recipient.clone();

        let payload = self.packager.decrypt_package(package, package_key)?;
        if one_time_use {
            self.transport.mark_token_used(token_id)?;
        }
        self.audit
            .record(AuditAction::PackageOpened, &recipient, &package.package_id);
        Ok(payload)
    }

    /// Run every expiry sweep.
    pub fn cleanup(&mut self) -> VaultResult<CleanupReport> {
        let report = CleanupReport {
            sessions: self.auth.cleanup_expired_sessions()?,
            approvals: self.workflow.cleanup_expired()?,
            tokens: self.transport.cleanup_expired_tokens()?,
        };
        info!(?report, "cleanup finished");
        Ok(report)
    }
}

/// Unseal the vault signing key, or mint and seal one on first open.
fn load_signing_key(store: &DocumentStore, config: &VaultConfig) -> VaultResult<SigningKey> {
    let path = config.signing_key_path();
    let sealing_key = store.derive_purpose_key("signing-key")?;

    if let Some(blob) = persist::read_json::<SealedBlob>(&path)? {
        let pkcs8 = Zeroizing::new(blob.open(sealing_key.as_bytes(), SIGNING_KEY_AAD)?);
        return SigningKey::from_pkcs8(&pkcs8);
    }

    let key = SigningKey::generate()?;
    let blob = SealedBlob::seal(sealing_key.as_bytes(), key.pkcs8(), SIGNING_KEY_AAD)?;
    persist::write_json_atomic(&path, &blob)?;
    info!(public_key = %key.public_key_base64(), "vault signing key created");
    Ok(key)
}
