use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{now, Engine, EngineError};

impl Engine {
    /// Record that the payment collaborator captured funds for a pending charge.
    pub async fn mark_charge_paid(
        &self,
        id: Ulid,
        method: PaymentMethod,
        reference: Option<String>,
        notes: Option<String>,
    ) -> Result<Charge, EngineError> {
        if reference.as_ref().is_some_and(|r| r.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        self.transition_charge(id, ChargeStatus::Paid, Some(method), reference, notes)
            .await
    }

    pub async fn mark_charge_comped(&self, id: Ulid, notes: Option<String>) -> Result<Charge, EngineError> {
        self.transition_charge(id, ChargeStatus::Comped, None, None, notes)
            .await
    }

    /// Bookkeeping only: asserts that money went back out-of-band.
    pub async fn mark_charge_refunded(&self, id: Ulid, notes: Option<String>) -> Result<Charge, EngineError> {
        self.transition_charge(id, ChargeStatus::Refunded, None, None, notes)
            .await
    }

    async fn transition_charge(
        &self,
        id: Ulid,
        to: ChargeStatus,
        payment_method: Option<PaymentMethod>,
        payment_reference: Option<String>,
        notes: Option<String>,
    ) -> Result<Charge, EngineError> {
        if notes.as_ref().is_some_and(|n| n.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let mut cal = self.calendar.write().await;
        let charge = cal.charges.get(&id).ok_or(EngineError::NotFound(id))?;
        if !charge.status.can_transition_to(to) {
            return Err(EngineError::InvalidChargeTransition {
                id,
                from: charge.status,
                to,
            });
        }
        let (from, user_id) = (charge.status, charge.user_id);

        let event = Event::ChargeUpdated {
            id,
            status: to,
            payment_method,
            payment_reference,
            notes,
            at: now(),
        };
        self.persist_and_apply(Some(&mut cal), None, Some(user_id), &event)
            .await?;
        info!(charge = %id, from = from.as_str(), to = to.as_str(), "charge updated");
        cal.charges.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
