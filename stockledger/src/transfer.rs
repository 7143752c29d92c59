//! Transfer workflow engine: moving quantity from warehouse batches to a
//! storefront's on-hand stock.
//!
//! Transfers walk a fixed state machine; only the edges listed on
//! [`TransferStatus::can_transition`] are legal, and every transition
//! appends one [`TransferAuditEntry`]; entries are never edited or
//! deleted. Stock moves exactly twice: `dispatch` deducts the warehouse
//! side (by allocating batches FIFO), `complete` credits the storefront
//! side. Cancelling an in-transit transfer voids its allocations, which
//! restores the derived warehouse availability.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{InventoryError, InventoryResult, StoreError};
use crate::integrity::{AvailabilityBreakdown, IntegrityConfig};
use crate::store::{InventoryStore, InventoryTransaction, RowKey, StagedOp};
use crate::types::{ActorId, BatchId, ProductId, Quantity, StorefrontId, TransferId, WarehouseId};

/// Lifecycle of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Being drafted; editable.
    Draft,
    /// Submitted, awaiting approval.
    Requested,
    /// Approved, awaiting dispatch.
    Approved,
    /// Dispatched; warehouse side deducted.
    InTransit,
    /// Arrived; storefront side credited. Terminal.
    Completed,
    /// Sent back for editing; may be resubmitted.
    Rejected,
    /// Abandoned. Terminal.
    Cancelled,
}

impl TransferStatus {
    /// The allowed state-machine edges. Everything else is rejected with
    /// [`InventoryError::InvalidTransition`].
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Draft | Self::Rejected, Self::Requested)
                | (Self::Requested, Self::Approved | Self::Rejected | Self::Cancelled)
                | (Self::Approved, Self::InTransit | Self::Cancelled)
                | (Self::InTransit, Self::Completed | Self::Cancelled)
        )
    }

    /// Only drafts and rejected (returned-for-edit) transfers accept
    /// mutating edits.
    pub const fn is_editable(self) -> bool {
        matches!(self, Self::Draft | Self::Rejected)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => f.write_str("DRAFT"),
            Self::Requested => f.write_str("REQUESTED"),
            Self::Approved => f.write_str("APPROVED"),
            Self::InTransit => f.write_str("IN_TRANSIT"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Rejected => f.write_str("REJECTED"),
            Self::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// What happened, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferAction {
    /// Draft created.
    Created,
    /// Draft or rejected transfer edited.
    Edited,
    /// Submitted for approval.
    Submitted,
    /// Approved (possibly with per-line overrides).
    Approved,
    /// Rejected back to editable.
    Rejected,
    /// Dispatched; warehouse quantities deducted.
    Dispatched,
    /// Completed; storefront quantities credited.
    Completed,
    /// Cancelled.
    Cancelled,
}

impl std::fmt::Display for TransferAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("CREATED"),
            Self::Edited => f.write_str("EDITED"),
            Self::Submitted => f.write_str("SUBMITTED"),
            Self::Approved => f.write_str("APPROVED"),
            Self::Rejected => f.write_str("REJECTED"),
            Self::Dispatched => f.write_str("DISPATCHED"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// One append-only audit log entry. Written on every transition, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferAuditEntry {
    /// What happened.
    pub action: TransferAction,
    /// Who did it.
    pub actor: ActorId,
    /// When.
    pub at: DateTime<Utc>,
    /// Free-form remarks (rejection reasons, carrier notes).
    pub remarks: Option<String>,
}

/// Units taken from one batch at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAllocation {
    /// The consumed batch.
    pub batch: BatchId,
    /// Units taken.
    pub quantity: u64,
}

/// One line item of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferLine {
    /// The product to move.
    pub product: ProductId,
    /// Units requested by the drafter.
    pub requested: u64,
    /// Approver's override, if any.
    pub approved: Option<u64>,
    /// Batch allocations filled at dispatch, voided on in-transit cancel.
    pub allocations: Vec<BatchAllocation>,
}

impl TransferLine {
    /// Units that actually move: the approved override when present,
    /// otherwise the requested quantity.
    pub fn effective_quantity(&self) -> u64 {
        self.approved.unwrap_or(self.requested)
    }
}

/// A movement of quantity from one warehouse to one storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Unique transfer identifier.
    pub id: TransferId,
    /// Source warehouse.
    pub warehouse: WarehouseId,
    /// Destination storefront.
    pub storefront: StorefrontId,
    /// Line items.
    pub lines: Vec<TransferLine>,
    /// Current status.
    pub status: TransferStatus,
    /// Free-form notes, editable while the transfer is editable.
    pub notes: Option<String>,
    /// When the draft was created.
    pub created_at: DateTime<Utc>,
    /// When the transfer was dispatched, once it has been.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// When the transfer was completed, once it has been.
    pub completed_at: Option<DateTime<Utc>>,
    /// Append-only audit log.
    pub audit: Vec<TransferAuditEntry>,
}

/// Input for drafting a transfer.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// Source warehouse.
    pub warehouse: WarehouseId,
    /// Destination storefront.
    pub storefront: StorefrontId,
    /// Initial line items (may be empty; `submit` requires at least one).
    pub lines: Vec<(ProductId, Quantity)>,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// Engine owning the transfer lifecycle.
#[derive(Debug, Clone)]
pub struct TransferEngine<S> {
    store: Arc<S>,
    config: IntegrityConfig,
}

impl<S: InventoryStore> TransferEngine<S> {
    /// Creates a transfer engine over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: IntegrityConfig::default(),
        }
    }

    /// Overrides the lock/retry discipline.
    #[must_use]
    pub fn with_config(mut self, config: IntegrityConfig) -> Self {
        self.config = config;
        self
    }

    /// Drafts a transfer. Lines repeating a product are merged into one
    /// line with the summed quantity; every stored transfer carries at
    /// most one line per product, which is what approval overrides and
    /// dispatch allocation key on.
    pub async fn create_draft(&self, new: NewTransfer, actor: &ActorId) -> InventoryResult<TransferRequest> {
        let now = Utc::now();
        let transfer = TransferRequest {
            id: TransferId::generate(),
            warehouse: new.warehouse,
            storefront: new.storefront,
            lines: merge_lines(new.lines),
            status: TransferStatus::Draft,
            notes: new.notes,
            created_at: now,
            dispatched_at: None,
            completed_at: None,
            audit: vec![TransferAuditEntry {
                action: TransferAction::Created,
                actor: actor.clone(),
                at: now,
                remarks: None,
            }],
        };
        self.store.insert_transfer(transfer.clone()).await?;
        tracing::info!(transfer = %transfer.id, warehouse = %transfer.warehouse, storefront = %transfer.storefront, "transfer drafted");
        Ok(transfer)
    }

    /// Reads the full transfer state including its audit log.
    pub async fn get(&self, id: &TransferId) -> InventoryResult<TransferRequest> {
        self.store.transfer(id).await?.ok_or_else(|| missing(id))
    }

    /// Replaces the line items of an editable transfer. Repeated products
    /// merge as in [`TransferEngine::create_draft`].
    pub async fn update_lines(
        &self,
        id: &TransferId,
        lines: Vec<(ProductId, Quantity)>,
        actor: &ActorId,
    ) -> InventoryResult<TransferRequest> {
        self.edit(id, actor, move |transfer| {
            transfer.lines = merge_lines(lines);
        })
        .await
    }

    /// Replaces the destination of an editable transfer.
    pub async fn update_destination(
        &self,
        id: &TransferId,
        storefront: StorefrontId,
        actor: &ActorId,
    ) -> InventoryResult<TransferRequest> {
        self.edit(id, actor, move |transfer| transfer.storefront = storefront)
            .await
    }

    /// Replaces the notes of an editable transfer.
    pub async fn update_notes(
        &self,
        id: &TransferId,
        notes: Option<String>,
        actor: &ActorId,
    ) -> InventoryResult<TransferRequest> {
        self.edit(id, actor, move |transfer| transfer.notes = notes).await
    }

    async fn edit(
        &self,
        id: &TransferId,
        actor: &ActorId,
        apply: impl FnOnce(&mut TransferRequest) + Send,
    ) -> InventoryResult<TransferRequest> {
        let mut tx = self
            .store
            .begin(vec![RowKey::Transfer(id.clone())], self.config.lock_timeout)
            .await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        if !transfer.status.is_editable() {
            return Err(InventoryError::NotEditable {
                transfer_id: id.clone(),
                status: transfer.status,
            });
        }
        apply(&mut transfer);
        transfer.audit.push(TransferAuditEntry {
            action: TransferAction::Edited,
            actor: actor.clone(),
            at: Utc::now(),
            remarks: None,
        });
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        Ok(transfer)
    }

    /// Submits a draft (or resubmits a rejected transfer) for approval.
    /// Requires at least one line item.
    pub async fn submit(&self, id: &TransferId, actor: &ActorId) -> InventoryResult<TransferRequest> {
        let mut tx = self
            .store
            .begin(vec![RowKey::Transfer(id.clone())], self.config.lock_timeout)
            .await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        check_edge(&transfer, TransferStatus::Requested)?;
        if transfer.lines.is_empty() {
            return Err(InventoryError::EmptyTransfer(id.clone()));
        }
        transfer.status = TransferStatus::Requested;
        transfer.audit.push(entry(TransferAction::Submitted, actor, None));
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        Ok(transfer)
    }

    /// Approves a requested transfer, optionally overriding per-line
    /// quantities (lines without an override move their requested
    /// quantity).
    pub async fn approve(
        &self,
        id: &TransferId,
        overrides: &HashMap<ProductId, Quantity>,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let mut tx = self
            .store
            .begin(vec![RowKey::Transfer(id.clone())], self.config.lock_timeout)
            .await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        check_edge(&transfer, TransferStatus::Approved)?;
        for line in &mut transfer.lines {
            line.approved = overrides.get(&line.product).map(|q| q.get());
        }
        transfer.status = TransferStatus::Approved;
        transfer.audit.push(entry(TransferAction::Approved, actor, remarks));
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        Ok(transfer)
    }

    /// Rejects a requested transfer back to its editable state.
    pub async fn reject(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let mut tx = self
            .store
            .begin(vec![RowKey::Transfer(id.clone())], self.config.lock_timeout)
            .await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        check_edge(&transfer, TransferStatus::Rejected)?;
        transfer.status = TransferStatus::Rejected;
        transfer.audit.push(entry(TransferAction::Rejected, actor, remarks));
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        Ok(transfer)
    }

    /// Dispatches an approved transfer: validates batch-backed
    /// availability per line, allocates FIFO by arrival date, and moves to
    /// `InTransit`. All-or-nothing across line items: a shortfall on any
    /// line leaves every batch untouched.
    pub async fn dispatch(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let mut attempt = 1;
        loop {
            match self.try_dispatch(id, actor, remarks.clone()).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_dispatch(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let current = self.get(id).await?;
        let mut keys = vec![RowKey::Transfer(id.clone())];
        keys.extend(
            current
                .lines
                .iter()
                .map(|line| RowKey::Product(line.product.clone())),
        );
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        check_edge(&transfer, TransferStatus::InTransit)?;

        // Re-validate and allocate under the product locks. Dispatch draws
        // from batch-backed stock only, so the check uses the dispatchable
        // figure rather than overall warehouse availability.
        let mut allocated_lines = Vec::with_capacity(transfer.lines.len());
        for line in &transfer.lines {
            let needed = line.effective_quantity();
            let stock = tx.warehouse_stock(&transfer.warehouse, &line.product).await?;
            let breakdown = AvailabilityBreakdown::dispatch(&stock, needed);
            if !breakdown.is_sufficient() {
                tracing::debug!(transfer = %id, product = %line.product, %breakdown, "dispatch rejected");
                return Err(InventoryError::InsufficientStock { breakdown });
            }
            let mut remaining = needed;
            let mut allocations = Vec::new();
            for batch in &stock.batches {
                if remaining == 0 {
                    break;
                }
                let take = u64::try_from(batch.remaining().max(0))
                    .unwrap_or(0)
                    .min(remaining);
                if take > 0 {
                    allocations.push(BatchAllocation {
                        batch: batch.batch.id.clone(),
                        quantity: take,
                    });
                    remaining -= take;
                }
            }
            if remaining > 0 {
                // Batches moved between the availability check and the
                // walk; treat as insufficient rather than corrupt.
                return Err(InventoryError::InsufficientStock { breakdown });
            }
            allocated_lines.push(allocations);
        }
        for (line, allocations) in transfer.lines.iter_mut().zip(allocated_lines) {
            line.allocations = allocations;
        }

        let now = Utc::now();
        transfer.status = TransferStatus::InTransit;
        transfer.dispatched_at = Some(now);
        transfer.audit.push(entry(TransferAction::Dispatched, actor, remarks));
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        tracing::info!(transfer = %id, "transfer dispatched");
        Ok(transfer)
    }

    /// Completes an in-transit transfer: credits the destination
    /// storefront rows and moves to `Completed`.
    pub async fn complete(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let mut attempt = 1;
        loop {
            match self.try_complete(id, actor, remarks.clone()).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_complete(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let current = self.get(id).await?;
        let mut keys = vec![RowKey::Transfer(id.clone())];
        keys.extend(current.lines.iter().map(|line| {
            RowKey::Storefront(current.storefront.clone(), line.product.clone())
        }));
        let mut tx = self.store.begin(keys, self.config.lock_timeout).await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        check_edge(&transfer, TransferStatus::Completed)?;

        for line in &transfer.lines {
            tx.stage(StagedOp::AdjustStorefront {
                storefront: transfer.storefront.clone(),
                product: line.product.clone(),
                delta: i64::try_from(line.effective_quantity()).unwrap_or(i64::MAX),
            });
        }
        let now = Utc::now();
        transfer.status = TransferStatus::Completed;
        transfer.completed_at = Some(now);
        transfer.audit.push(entry(TransferAction::Completed, actor, remarks));
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        tracing::info!(transfer = %id, storefront = %transfer.storefront, "transfer completed");
        Ok(transfer)
    }

    /// Cancels a transfer. From `InTransit` this voids the batch
    /// allocations, restoring the warehouse quantities the dispatch had
    /// deducted; from earlier states stock was never touched. Cancelling
    /// an already-cancelled transfer is a no-op (no error, no audit entry,
    /// no double restoration).
    pub async fn cancel(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let mut attempt = 1;
        loop {
            match self.try_cancel(id, actor, remarks.clone()).await {
                Err(err) if err.is_transient() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_cancel(
        &self,
        id: &TransferId,
        actor: &ActorId,
        remarks: Option<String>,
    ) -> InventoryResult<TransferRequest> {
        let mut tx = self
            .store
            .begin(vec![RowKey::Transfer(id.clone())], self.config.lock_timeout)
            .await?;
        let mut transfer = tx.transfer(id).await?.ok_or_else(|| missing(id))?;
        if transfer.status == TransferStatus::Cancelled {
            return Ok(transfer);
        }
        check_edge(&transfer, TransferStatus::Cancelled)?;

        if transfer.status == TransferStatus::InTransit {
            for line in &mut transfer.lines {
                line.allocations.clear();
            }
        }
        transfer.status = TransferStatus::Cancelled;
        transfer.audit.push(entry(TransferAction::Cancelled, actor, remarks));
        tx.stage(StagedOp::UpdateTransfer(transfer.clone()));
        tx.commit().await?;
        tracing::info!(transfer = %id, "transfer cancelled");
        Ok(transfer)
    }
}

fn entry(action: TransferAction, actor: &ActorId, remarks: Option<String>) -> TransferAuditEntry {
    TransferAuditEntry {
        action,
        actor: actor.clone(),
        at: Utc::now(),
        remarks,
    }
}

fn check_edge(transfer: &TransferRequest, to: TransferStatus) -> InventoryResult<()> {
    if transfer.status.can_transition(to) {
        Ok(())
    } else {
        Err(InventoryError::InvalidTransition {
            transfer_id: transfer.id.clone(),
            from: transfer.status,
            to,
        })
    }
}

fn missing(id: &TransferId) -> InventoryError {
    InventoryError::from(StoreError::NotFound {
        entity: "transfer",
        id: id.to_string(),
    })
}

/// Folds repeated products into one line each, summing their quantities.
/// First-occurrence order is kept.
fn merge_lines(lines: Vec<(ProductId, Quantity)>) -> Vec<TransferLine> {
    let mut merged: Vec<TransferLine> = Vec::with_capacity(lines.len());
    for (product, quantity) in lines {
        match merged.iter_mut().find(|line| line.product == product) {
            Some(line) => line.requested += quantity.get(),
            None => merged.push(TransferLine {
                product,
                requested: quantity.get(),
                approved: None,
                allocations: Vec::new(),
            }),
        }
    }
    merged
}
