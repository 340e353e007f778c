//! Approval workflow.
//!
//! Each [`DataRequest`] has exactly one [`DataApproval`], which moves through
//!
//! ```text
//! pending ──approve──▶ approved ──last use──▶ exhausted
//!    │                    │
//!    ├──reject──▶ rejected ◀──revoke── (any state)
//!    │                    │
//!    └──expiry──▶ expired ◀──validUntil lapses
//! ```
//!
//! `approved` and `rejected` are terminal for `approve_request`; only the
//! owner override [`ApprovalWorkflow::revoke_approval`] leaves them. State is
//! persisted to `workflow.json` after every mutation.
//!
//! Time semantics: a request's `expiresAt` is the first instant it is no
//! longer valid; an approval's `validUntil` is the last instant it is.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::crypto;
use crate::encoding;
use crate::error::{VaultError, VaultResult};
use crate::keys::SigningKey;
use crate::persist;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl Requester {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            organization: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

/// A third party's request for fields of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub request_id: String,
    pub requester: Requester,
    pub category: String,
    pub fields: Vec<String>,
    pub purpose: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Base64 Ed25519 signature over [`DataRequest::canonical_bytes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Base64 raw Ed25519 public key of the signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// The signed view of a request. Field order is fixed by declaration order
/// and `fields` is sorted, so signer and verifier agree on the bytes.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalRequest<'a> {
    request_id: &'a str,
    requester: &'a Requester,
    category: &'a str,
    fields: Vec<&'a str>,
    purpose: &'a str,
    created_at: i64,
    expires_at: i64,
}

impl DataRequest {
    /// A request created now that expires after `ttl`. Fails if `ttl` is not
    /// positive or runs past the representable range.
    pub fn new<I, S>(
        request_id: impl Into<String>,
        requester: Requester,
        category: impl Into<String>,
        fields: I,
        purpose: impl Into<String>,
        ttl: Duration,
    ) -> VaultResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let created_at = crate::now_millis();
        Ok(Self {
            request_id: request_id.into(),
            requester,
            category: category.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            purpose: purpose.into(),
            created_at,
            expires_at: crate::expiry(created_at, ttl, "request")?,
            signature: None,
            public_key: None,
        })
    }

    pub fn canonical_bytes(&self) -> VaultResult<Vec<u8>> {
        let mut fields: Vec<&str> = self.fields.iter().map(String::as_str).collect();
        fields.sort_unstable();
        let view = CanonicalRequest {
            request_id: &self.request_id,
            requester: &self.requester,
            category: &self.category,
            fields,
            purpose: &self.purpose,
            created_at: self.created_at.timestamp_millis(),
            expires_at: self.expires_at.timestamp_millis(),
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Sign the request in place with the requester's key.
    pub fn sign(&mut self, key: &SigningKey) -> VaultResult<()> {
        let signature = key.sign(&self.canonical_bytes()?);
        self.signature = Some(encoding::encode(signature));
        self.public_key = Some(key.public_key_base64());
        Ok(())
    }

    /// Check the attached signature. Unsigned requests pass.
    pub fn verify_signature(&self) -> VaultResult<()> {
        let Some(signature) = &self.signature else {
            return Ok(());
        };
        let public_key = self
            .public_key
            .as_deref()
            .ok_or_else(|| VaultError::validation("signed request carries no public key"))?;

        let signature = encoding::decode(signature)?;
        let public_key = encoding::decode(public_key)?;
        if crypto::verify_signature(&public_key, &self.canonical_bytes()?, &signature) {
            Ok(())
        } else {
            Err(VaultError::IntegrityFailure)
        }
    }

    fn validate(&self) -> VaultResult<()> {
        let required = [
            ("request id", &self.request_id),
            ("requester id", &self.requester.id),
            ("requester name", &self.requester.name),
            ("category", &self.category),
            ("purpose", &self.purpose),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(VaultError::validation(format!("{name} is required")));
        }
        if self.fields.is_empty() || self.fields.iter().any(|f| f.is_empty()) {
            return Err(VaultError::validation("at least one non-empty field is required"));
        }
        if self.expires_at <= self.created_at {
            return Err(VaultError::validation("expiresAt must be after createdAt"));
        }
        self.verify_signature()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    /// Approved, but every allowed use has been consumed.
    Exhausted,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRestrictions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_remaining: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_recipients: Option<Vec<String>>,
}

impl ApprovalRestrictions {
    pub fn max_uses(mut self, uses: u32) -> Self {
        self.max_uses = Some(uses);
        self.uses_remaining = Some(uses);
        self
    }

    pub fn valid_until(mut self, until: DateTime<Utc>) -> Self {
        self.valid_until = Some(until);
        self
    }

    pub fn allowed_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_recipients = Some(recipients.into_iter().map(Into::into).collect());
        self
    }

    fn normalized(mut self) -> Self {
        if self.uses_remaining.is_none() {
            self.uses_remaining = self.max_uses;
        }
        self
    }

    fn lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| now > until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataApproval {
    pub request_id: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<ApprovalRestrictions>,
}

impl DataApproval {
    fn pending(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: ApprovalStatus::Pending,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            reason: None,
            restrictions: None,
        }
    }
}

/// The owner's answer to a pending request.
#[derive(Debug, Clone, Default)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
    pub restrictions: Option<ApprovalRestrictions>,
}

impl ApprovalDecision {
    pub fn approve(restrictions: Option<ApprovalRestrictions>) -> Self {
        Self {
            approved: true,
            reason: None,
            restrictions,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            restrictions: None,
        }
    }
}

/// On-disk shape of `workflow.json`.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowState {
    pending_requests: Vec<DataRequest>,
    approvals: Vec<DataApproval>,
    /// Requests that left the pending set, kept so approved ones can still
    /// be fulfilled.
    #[serde(default)]
    processed_requests: Vec<DataRequest>,
}

/// Live workflow state keyed by request id.
#[derive(Clone, Default)]
struct Ledger {
    pending: BTreeMap<String, DataRequest>,
    processed: BTreeMap<String, DataRequest>,
    approvals: BTreeMap<String, DataApproval>,
}

impl Ledger {
    fn from_state(state: WorkflowState) -> Self {
        let by_id = |requests: Vec<DataRequest>| {
            requests
                .into_iter()
                .map(|r| (r.request_id.clone(), r))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            pending: by_id(state.pending_requests),
            processed: by_id(state.processed_requests),
            approvals: state
                .approvals
                .into_iter()
                .map(|a| (a.request_id.clone(), a))
                .collect(),
        }
    }

    fn to_state(&self) -> WorkflowState {
        WorkflowState {
            pending_requests: self.pending.values().cloned().collect(),
            approvals: self.approvals.values().cloned().collect(),
            processed_requests: self.processed.values().cloned().collect(),
        }
    }

    fn approval_mut(&mut self, request_id: &str) -> VaultResult<&mut DataApproval> {
        self.approvals
            .get_mut(request_id)
            .ok_or_else(|| VaultError::not_found("approval", request_id))
    }

    /// Move a request out of the pending set.
    fn retire(&mut self, request_id: &str) {
        if let Some(request) = self.pending.remove(request_id) {
            self.processed.insert(request_id.to_string(), request);
        }
    }
}

pub struct ApprovalWorkflow {
    path: Option<PathBuf>,
    ledger: Ledger,
}

impl ApprovalWorkflow {
    pub fn open(config: &VaultConfig) -> VaultResult<Self> {
        let path = config.workflow_path();
        let state: WorkflowState = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            ledger: Ledger::from_state(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            ledger: Ledger::default(),
        }
    }

    /// Apply `change` to a copy of the ledger. The copy replaces the live
    /// ledger only after it has been written.
    fn commit<T>(&mut self, change: impl FnOnce(&mut Ledger) -> VaultResult<T>) -> VaultResult<T> {
        let mut next = self.ledger.clone();
        let out = change(&mut next)?;
        if let Some(path) = &self.path {
            persist::write_json_atomic(path, &next.to_state())?;
        }
        self.ledger = next;
        Ok(out)
    }

    fn approval(&self, request_id: &str) -> VaultResult<&DataApproval> {
        self.ledger
            .approvals
            .get(request_id)
            .ok_or_else(|| VaultError::not_found("approval", request_id))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    pub fn submit_request(&mut self, request: DataRequest) -> VaultResult<DataApproval> {
        self.submit_request_at(request, Utc::now())
    }

    pub fn submit_request_at(
        &mut self,
        request: DataRequest,
        now: DateTime<Utc>,
    ) -> VaultResult<DataApproval> {
        request.validate()?;

        let id = request.request_id.clone();
        if self.ledger.approvals.contains_key(&id) {
            return Err(VaultError::StateConflict(format!("request {id} already exists")));
        }
        if request.is_expired_at(now) {
            return Err(VaultError::Expired(format!("request {id}")));
        }

        let approval = DataApproval::pending(&id);
        self.commit(|ledger| {
            ledger.pending.insert(id.clone(), request);
            ledger.approvals.insert(id.clone(), approval.clone());
            Ok(())
        })?;

        info!(request_id = %id, "request submitted");
        Ok(approval)
    }

    pub fn approve_request(
        &mut self,
        request_id: &str,
        approved_by: &str,
        decision: ApprovalDecision,
    ) -> VaultResult<DataApproval> {
        self.approve_request_at(request_id, approved_by, decision, crate::now_millis())
    }

    /// Decide a pending request. An expired request moves to `expired` and
    /// the call fails; any non-pending request fails as already processed.
    pub fn approve_request_at(
        &mut self,
        request_id: &str,
        approved_by: &str,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> VaultResult<DataApproval> {
        let status = self.approval(request_id)?.status;
        if status != ApprovalStatus::Pending {
            return Err(VaultError::StateConflict(format!(
                "request {request_id} already processed ({status})"
            )));
        }

        let expired = self
            .ledger
            .pending
            .get(request_id)
            .map_or(true, |r| r.is_expired_at(now));
        if expired {
            self.commit(|ledger| {
                ledger.approval_mut(request_id)?.status = ApprovalStatus::Expired;
                ledger.retire(request_id);
                Ok(())
            })?;
            warn!(request_id, "approval attempted on expired request");
            return Err(VaultError::Expired(format!("request {request_id}")));
        }

        let approval = self.commit(|ledger| {
            let approval = ledger.approval_mut(request_id)?;
            if decision.approved {
                approval.status = ApprovalStatus::Approved;
                approval.approved_by = Some(approved_by.to_string());
                approval.approved_at = Some(now);
                approval.restrictions =
                    decision.restrictions.map(ApprovalRestrictions::normalized);
            } else {
                approval.status = ApprovalStatus::Rejected;
                approval.rejected_by = Some(approved_by.to_string());
                approval.rejected_at = Some(now);
                approval.reason = decision.reason;
            }
            let approval = approval.clone();
            ledger.retire(request_id);
            Ok(approval)
        })?;

        info!(request_id, status = %approval.status, by = approved_by, "request decided");
        Ok(approval)
    }

    pub fn reject_request(
        &mut self,
        request_id: &str,
        rejected_by: &str,
        reason: impl Into<String>,
    ) -> VaultResult<DataApproval> {
        self.approve_request(request_id, rejected_by, ApprovalDecision::reject(reason))
    }

    /// Owner override: force any approval to `rejected`, recording who did it.
    pub fn revoke_approval(
        &mut self,
        request_id: &str,
        revoked_by: &str,
        reason: impl Into<String>,
    ) -> VaultResult<DataApproval> {
        let previous = self.approval(request_id)?.status;
        let reason = reason.into();
        let approval = self.commit(|ledger| {
            let approval = ledger.approval_mut(request_id)?;
            approval.status = ApprovalStatus::Rejected;
            approval.rejected_by = Some(revoked_by.to_string());
            approval.rejected_at = Some(crate::now_millis());
            approval.reason = Some(reason);
            let approval = approval.clone();
            ledger.retire(request_id);
            Ok(approval)
        })?;

        info!(request_id, from = %previous, by = revoked_by, "approval revoked");
        Ok(approval)
    }

    pub fn can_fulfill_request(&self, request_id: &str) -> bool {
        self.can_fulfill_request_at(request_id, Utc::now())
    }

    pub fn can_fulfill_request_at(&self, request_id: &str, now: DateTime<Utc>) -> bool {
        let Some(approval) = self.ledger.approvals.get(request_id) else {
            return false;
        };
        if approval.status != ApprovalStatus::Approved {
            return false;
        }
        match &approval.restrictions {
            None => true,
            Some(r) => !r.lapsed_at(now) && r.uses_remaining.map_or(true, |n| n > 0),
        }
    }

    /// Consume one use. Returns the remaining count when uses are tracked.
    /// Reaching zero moves the approval to `exhausted`.
    pub fn record_fulfillment(&mut self, request_id: &str) -> VaultResult<Option<u32>> {
        let remaining = self.commit(|ledger| {
            let approval = ledger.approval_mut(request_id)?;
            if approval.status != ApprovalStatus::Approved {
                return Err(VaultError::StateConflict(format!(
                    "request {request_id} is {}",
                    approval.status
                )));
            }

            let remaining = match approval
                .restrictions
                .as_mut()
                .and_then(|r| r.uses_remaining.as_mut())
            {
                None => None,
                Some(0) => {
                    return Err(VaultError::StateConflict(format!(
                        "request {request_id} has no uses remaining"
                    )));
                }
                Some(n) => {
                    *n -= 1;
                    Some(*n)
                }
            };
            if remaining == Some(0) {
                approval.status = ApprovalStatus::Exhausted;
            }
            Ok(remaining)
        })?;

        debug!(request_id, ?remaining, "fulfillment recorded");
        Ok(remaining)
    }

    /// Give back a use taken by [`record_fulfillment`](Self::record_fulfillment)
    /// when the rest of the fulfillment could not be committed.
    pub(crate) fn release_fulfillment(&mut self, request_id: &str) -> VaultResult<()> {
        self.commit(|ledger| {
            let approval = ledger.approval_mut(request_id)?;
            let Some(restrictions) = approval.restrictions.as_mut() else {
                return Ok(());
            };
            let (Some(max), Some(remaining)) =
                (restrictions.max_uses, restrictions.uses_remaining.as_mut())
            else {
                return Ok(());
            };
            if *remaining < max {
                *remaining += 1;
            }
            if approval.status == ApprovalStatus::Exhausted {
                approval.status = ApprovalStatus::Approved;
            }
            Ok(())
        })?;
        debug!(request_id, "fulfillment released");
        Ok(())
    }

    pub fn cleanup_expired(&mut self) -> VaultResult<usize> {
        self.cleanup_expired_at(Utc::now())
    }

    /// Expire pending requests past `expiresAt` and approvals past
    /// `validUntil`. Returns how many approvals changed.
    pub fn cleanup_expired_at(&mut self, now: DateTime<Utc>) -> VaultResult<usize> {
        let stale_pending: Vec<String> = self
            .ledger
            .pending
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.request_id.clone())
            .collect();
        let is_lapsed = |approval: &DataApproval| {
            approval.status == ApprovalStatus::Approved
                && approval
                    .restrictions
                    .as_ref()
                    .is_some_and(|r| r.lapsed_at(now))
        };
        let lapsed = self.ledger.approvals.values().filter(|&a| is_lapsed(a)).count();

        let changed = stale_pending.len() + lapsed;
        if changed == 0 {
            return Ok(0);
        }
        self.commit(|ledger| {
            for id in &stale_pending {
                if let Some(approval) = ledger.approvals.get_mut(id) {
                    approval.status = ApprovalStatus::Expired;
                }
                ledger.retire(id);
            }
            for approval in ledger.approvals.values_mut() {
                if is_lapsed(&*approval) {
                    approval.status = ApprovalStatus::Expired;
                }
            }
            Ok(())
        })?;

        info!(pending = stale_pending.len(), approved = lapsed, "expired approvals swept");
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The request, whether still pending or already decided.
    pub fn get_request(&self, request_id: &str) -> Option<&DataRequest> {
        self.ledger
            .pending
            .get(request_id)
            .or_else(|| self.ledger.processed.get(request_id))
    }

    pub fn get_approval(&self, request_id: &str) -> Option<&DataApproval> {
        self.ledger.approvals.get(request_id)
    }

    pub fn list_pending(&self) -> Vec<&DataRequest> {
        self.ledger.pending.values().collect()
    }

    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> Vec<&DataApproval> {
        self.ledger
            .approvals
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect()
    }

    pub fn is_recipient_allowed(&self, request_id: &str, recipient: &str) -> VaultResult<bool> {
        let approval = self.approval(request_id)?;
        Ok(approval
            .restrictions
            .as_ref()
            .and_then(|r| r.allowed_recipients.as_ref())
            .map_or(true, |allowed| allowed.iter().any(|r| r == recipient)))
    }
}

impl fmt::Debug for ApprovalWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalWorkflow")
            .field("path", &self.path)
            .field("pending", &self.ledger.pending.len())
            .field("approvals", &self.ledger.approvals.len())
            .finish()
    }
}
