//! Messages delivered to a repository supervisor.
//!
//! Supervisors receive these via a bounded `tokio::sync::mpsc` channel and
//! process them strictly in order, which is what serializes all model
//! mutation for a repository.

use crate::events::Event;
use crate::types::DeliveryId;

/// A normalized event together with its webhook delivery id (if it came
/// from the host; CI callbacks carry none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Delivery id used to drop host re-deliveries. `None` disables dedup.
    pub delivery: Option<DeliveryId>,

    pub event: Event,
}

impl Envelope {
    pub fn new(delivery: Option<DeliveryId>, event: Event) -> Self {
        Envelope { delivery, event }
    }

    /// An envelope with no delivery id (CI callbacks, internal events).
    pub fn anonymous(event: Event) -> Self {
        Envelope {
            delivery: None,
            event,
        }
    }
}

/// A message on a supervisor's queue.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// A normalized external event.
    Event(Envelope),

    /// Periodic timer: refresh stale mergeability and re-run the scheduler.
    Tick,
}
