use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_window;
use super::{Engine, EngineError};

fn overlapped_reservations(cal: &Calendar, span: &Span) -> Vec<Reservation> {
    let mut affected: Vec<Reservation> = cal
        .overlapping(span)
        .filter(|i| i.kind == IntervalKind::Reservation)
        .filter_map(|i| cal.reservations.get(&i.id).cloned())
        .collect();
    affected.sort_by_key(|r| r.span.start);
    affected
}

impl Engine {
    /// Close the space for `span`. Active reservations it overlaps are left in place
    /// and returned so staff can contact the members.
    pub async fn add_closure(&self, closure: SpaceClosure) -> Result<Vec<Reservation>, EngineError> {
        validate_window(closure.span.start, closure.span.end)?;
        if closure.notes.as_ref().is_some_and(|n| n.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let mut cal = self.calendar.write().await;
        if cal.closures.contains_key(&closure.id) {
            return Err(EngineError::AlreadyExists(closure.id));
        }
        let affected = overlapped_reservations(&cal, &closure.span);

        let span = closure.span;
        let event = Event::ClosureAdded { closure };
        self.persist_and_apply(Some(&mut cal), None, None, &event)
            .await?;
        self.invalidate_span_days(&span);
        if !affected.is_empty() {
            warn!(closure = %span, reservations = affected.len(), "closure overlaps active reservations");
        }
        info!(closure = %span, "space closure added");
        Ok(affected)
    }

    pub async fn remove_closure(&self, id: Ulid) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        let span = cal.closures.get(&id).ok_or(EngineError::NotFound(id))?.span;
        let event = Event::ClosureRemoved { id };
        self.persist_and_apply(Some(&mut cal), None, None, &event)
            .await?;
        self.invalidate_span_days(&span);
        info!(closure = %id, "space closure removed");
        Ok(())
    }

    /// Record (or move) an approved production. Like closures, overlapped
    /// reservations are returned rather than cancelled.
    pub async fn upsert_production(&self, production: Production) -> Result<Vec<Reservation>, EngineError> {
        validate_window(production.span.start, production.span.end)?;
        if production.title.is_empty() || production.title.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("production title must be 1..=256 bytes"));
        }
        let mut cal = self.calendar.write().await;
        let previous = cal.productions.get(&production.id).map(|p| p.span);
        let affected = overlapped_reservations(&cal, &production.span);

        let span = production.span;
        let event = Event::ProductionUpserted { production };
        self.persist_and_apply(Some(&mut cal), None, None, &event)
            .await?;
        if let Some(previous) = previous {
            self.invalidate_span_days(&previous);
        }
        self.invalidate_span_days(&span);
        info!(production = %span, overlapped = affected.len(), "production recorded");
        Ok(affected)
    }

    pub async fn remove_production(&self, id: Ulid) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        let span = cal.productions.get(&id).ok_or(EngineError::NotFound(id))?.span;
        let event = Event::ProductionRemoved { id };
        self.persist_and_apply(Some(&mut cal), None, None, &event)
            .await?;
        self.invalidate_span_days(&span);
        Ok(())
    }
}
