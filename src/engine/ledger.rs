use std::collections::BTreeMap;

use tracing::{info, warn};
use ulid::Ulid;

use crate::cache::credit_key;
use crate::limits::*;
use crate::model::*;

use super::{now, Engine, EngineError};

pub(crate) const META_ALLOCATION_MONTH: &str = "allocation_month";
pub(crate) const META_ALLOCATED_AMOUNT: &str = "allocated_amount";

/// Outcome of one monthly allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationReport {
    pub month: String,
    pub allocated: u32,
    pub already_allocated: u32,
    pub blocks_granted: i64,
    pub blocks_reset: i64,
}

pub(crate) fn new_transaction(
    user_id: Ulid,
    credit_type: CreditType,
    amount: i64,
    source: CreditSource,
    reference: Option<EntityRef>,
    description: Option<String>,
    at: Timestamp,
) -> CreditTransaction {
    CreditTransaction {
        id: Ulid::new(),
        user_id,
        credit_type,
        amount,
        source,
        reference,
        description,
        metadata: BTreeMap::new(),
        created_at: at,
    }
}

fn validate_amount(blocks: i64) -> Result<(), EngineError> {
    if blocks <= 0 {
        return Err(EngineError::LimitExceeded("credit amount must be positive"));
    }
    if blocks > MAX_CREDIT_AMOUNT {
        return Err(EngineError::LimitExceeded("credit amount too large"));
    }
    Ok(())
}

fn validate_description(description: &Option<String>) -> Result<(), EngineError> {
    if description.as_ref().is_some_and(|d| d.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

/// Blocks granted for `month` so far: the allocation plus any upgrade top-ups.
fn granted_in_month(account: &Account, month: &str) -> Option<i64> {
    let mut allocated = false;
    let mut total = 0;
    for txn in &account.transactions {
        let in_month = txn.metadata.get(META_ALLOCATION_MONTH).map(String::as_str) == Some(month);
        match txn.source {
            CreditSource::MonthlyAllocation if in_month => {
                allocated = true;
                total += txn.amount;
            }
            CreditSource::UpgradeAdjustment if in_month => total += txn.amount,
            _ => {}
        }
    }
    allocated.then_some(total)
}

impl Engine {
    pub(crate) fn month_key(&self, at: Timestamp) -> String {
        self.policy.local_date(at).format("%Y-%m").to_string()
    }

    /// Record membership facts. When a member already allocated this month moves
    /// to a larger allocation, the difference is granted right away.
    pub async fn upsert_member(
        &self,
        profile: MemberProfile,
    ) -> Result<Option<CreditTransaction>, EngineError> {
        if profile.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("member name too long"));
        }
        if !(0..=MAX_CREDIT_AMOUNT).contains(&profile.monthly_free_blocks) {
            return Err(EngineError::LimitExceeded("monthly allocation out of range"));
        }

        let at = now();
        let month = self.month_key(at);
        let _fence = self.calendar.read().await;
        let account = self.account(profile.user_id);
        let mut guard = account.write().await;

        let adjustment = match granted_in_month(&guard, &month) {
            Some(granted) if profile.sustaining && profile.monthly_free_blocks > granted => {
                let mut txn = new_transaction(
                    profile.user_id,
                    CreditType::FreeHours,
                    profile.monthly_free_blocks - granted,
                    CreditSource::UpgradeAdjustment,
                    None,
                    Some(format!("Allocation increase for {month}")),
                    at,
                );
                txn.metadata.insert(META_ALLOCATION_MONTH.into(), month.clone());
                Some(txn)
            }
            _ => None,
        };

        let user_id = profile.user_id;
        let event = Event::MemberUpserted {
            profile,
            adjustment: adjustment.clone(),
        };
        self.persist_and_apply(None, Some(&mut guard), Some(user_id), &event)
            .await?;
        self.cache.invalidate_user(user_id);
        if let Some(txn) = &adjustment {
            info!(user = %user_id, blocks = txn.amount, "upgrade adjustment granted");
        }
        Ok(adjustment)
    }

    /// Append a positive transaction. Returns the new balance.
    pub async fn add_credit(
        &self,
        user_id: Ulid,
        blocks: i64,
        credit_type: CreditType,
        source: CreditSource,
        reference: Option<EntityRef>,
        description: Option<String>,
    ) -> Result<i64, EngineError> {
        validate_amount(blocks)?;
        validate_description(&description)?;
        let txn = new_transaction(user_id, credit_type, blocks, source, reference, description, now());
        self.record_credits(user_id, credit_type, vec![txn]).await
    }

    /// Append a negative transaction of exactly `blocks`, failing if the balance can't cover it.
    /// Returns the new balance.
    pub async fn deduct_credit(
        &self,
        user_id: Ulid,
        blocks: i64,
        credit_type: CreditType,
        source: CreditSource,
        reference: Option<EntityRef>,
        description: Option<String>,
    ) -> Result<i64, EngineError> {
        validate_amount(blocks)?;
        validate_description(&description)?;
        let _fence = self.calendar.read().await;
        let account = self.account(user_id);
        let mut guard = account.write().await;
        let balance = guard.balance(credit_type);
        if balance < blocks {
            return Err(EngineError::InsufficientCredit {
                credit_type,
                balance,
                requested: blocks,
            });
        }
        let txn = new_transaction(user_id, credit_type, -blocks, source, reference, description, now());
        let event = Event::CreditsRecorded {
            transactions: vec![txn],
        };
        self.persist_and_apply(None, Some(&mut guard), Some(user_id), &event)
            .await?;
        self.cache.invalidate_user(user_id);
        metrics::counter!(crate::observability::CREDITS_DEDUCTED_TOTAL).increment(blocks as u64);
        Ok(guard.balance(credit_type))
    }

    async fn record_credits(
        &self,
        user_id: Ulid,
        credit_type: CreditType,
        transactions: Vec<CreditTransaction>,
    ) -> Result<i64, EngineError> {
        let _fence = self.calendar.read().await;
        let account = self.account(user_id);
        let mut guard = account.write().await;
        let event = Event::CreditsRecorded { transactions };
        self.persist_and_apply(None, Some(&mut guard), Some(user_id), &event)
            .await?;
        self.cache.invalidate_user(user_id);
        Ok(guard.balance(credit_type))
    }

    /// Signed sum of the user's transactions of this type.
    pub async fn get_credit_balance(&self, user_id: Ulid, credit_type: CreditType) -> i64 {
        let key = credit_key(user_id, credit_type);
        if let Some(balance) = self.cache.balances.get(&key) {
            return balance;
        }
        let Some(account) = self.accounts.get(&user_id).map(|a| a.value().clone()) else {
            return 0;
        };
        let guard = account.read().await;
        let balance = guard.balance(credit_type);
        self.cache.balances.insert(key, balance);
        balance
    }

    pub async fn credit_balances(&self, user_id: Ulid) -> Vec<(CreditType, i64)> {
        let mut balances = Vec::with_capacity(CreditType::ALL.len());
        for credit_type in CreditType::ALL {
            balances.push((credit_type, self.get_credit_balance(user_id, credit_type).await));
        }
        balances
    }

    /// A user's ledger in append order, optionally narrowed to one credit type.
    pub async fn credit_transactions(
        &self,
        user_id: Ulid,
        credit_type: Option<CreditType>,
    ) -> Vec<CreditTransaction> {
        let Some(account) = self.accounts.get(&user_id).map(|a| a.value().clone()) else {
            return Vec::new();
        };
        let guard = account.read().await;
        guard
            .transactions
            .iter()
            .filter(|t| credit_type.is_none_or(|ct| t.credit_type == ct))
            .cloned()
            .collect()
    }

    /// Grant every sustaining member their monthly free hours, once per local month.
    /// Leftover blocks don't roll over: a reset entry zeroes them first.
    pub async fn allocate_monthly_credits(&self, at: Timestamp) -> Result<AllocationReport, EngineError> {
        let month = self.month_key(at);
        let mut report = AllocationReport {
            month: month.clone(),
            ..Default::default()
        };

        let mut members: Vec<MemberProfile> = self
            .members
            .iter()
            .filter(|m| m.sustaining && m.monthly_free_blocks > 0)
            .map(|m| m.value().clone())
            .collect();
        members.sort_by_key(|m| m.user_id);

        let _fence = self.calendar.read().await;
        for member in members {
            let account = self.account(member.user_id);
            let mut guard = account.write().await;
            if granted_in_month(&guard, &month).is_some() {
                report.already_allocated += 1;
                continue;
            }

            let mut transactions = Vec::with_capacity(2);
            let leftover = guard.balance(CreditType::FreeHours);
            if leftover > 0 {
                let mut reset = new_transaction(
                    member.user_id,
                    CreditType::FreeHours,
                    -leftover,
                    CreditSource::MonthlyReset,
                    None,
                    Some(format!("Unused free hours expired before {month}")),
                    at,
                );
                reset.metadata.insert(META_ALLOCATION_MONTH.into(), month.clone());
                transactions.push(reset);
                report.blocks_reset += leftover;
            }
            let mut grant = new_transaction(
                member.user_id,
                CreditType::FreeHours,
                member.monthly_free_blocks,
                CreditSource::MonthlyAllocation,
                None,
                Some(format!("Monthly free hours for {month}")),
                at,
            );
            grant.metadata.insert(META_ALLOCATION_MONTH.into(), month.clone());
            grant
                .metadata
                .insert(META_ALLOCATED_AMOUNT.into(), member.monthly_free_blocks.to_string());
            transactions.push(grant);

            let event = Event::CreditsRecorded { transactions };
            match self
                .persist_and_apply(None, Some(&mut guard), Some(member.user_id), &event)
                .await
            {
                Ok(()) => {
                    self.cache.invalidate_user(member.user_id);
                    report.allocated += 1;
                    report.blocks_granted += member.monthly_free_blocks;
                }
                Err(e @ EngineError::WalError(_)) => return Err(e),
                Err(e) => warn!(user = %member.user_id, "monthly allocation failed: {e}"),
            }
        }

        info!(
            month = %report.month,
            allocated = report.allocated,
            already_allocated = report.already_allocated,
            "monthly credit allocation finished"
        );
        Ok(report)
    }
}
