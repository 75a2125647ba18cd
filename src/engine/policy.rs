use crate::config::BookingPolicy;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

impl BookingPolicy {
    /// Earliest start a new reservation may request at `now`.
    pub fn earliest_start(&self, now: Ms) -> Ms {
        now + self.min_advance
    }

    /// Lead-time rule, applied on creation only.
    pub fn check_lead_time(&self, start: Ms, now: Ms) -> Result<(), EngineError> {
        let earliest = self.earliest_start(now);
        if start < earliest {
            return Err(EngineError::SchedulingWindow {
                requested: start,
                earliest,
            });
        }
        Ok(())
    }
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidSpan { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_participants(participants: u32) -> Result<u32, EngineError> {
    if participants == 0 {
        return Err(EngineError::InvalidParticipants);
    }
    Ok(participants)
}
