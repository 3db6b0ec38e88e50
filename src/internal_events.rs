//! Structured observability events: each pairs a log line with a counter.

use metrics::counter;
use tracing::{debug, error, trace, warn};

pub(crate) trait InternalEvent {
    fn emit(self);
}

macro_rules! emit {
    ($event:expr) => {
        $crate::internal_events::InternalEvent::emit($event)
    };
}

pub(crate) use emit;

#[derive(Debug)]
pub(crate) struct MergedEventEmitted {
    pub lines: usize,
    pub bytes: usize,
}

impl InternalEvent for MergedEventEmitted {
    fn emit(self) {
        trace!(
            message = "Emitted merged event.",
            lines = self.lines,
            bytes = self.bytes,
        );
        counter!("multiline_merged_events_total").increment(1);
    }
}

#[derive(Debug)]
pub(crate) struct DownstreamDeliveryError<'a> {
    pub error: &'a crate::Error,
}

impl InternalEvent for DownstreamDeliveryError<'_> {
    fn emit(self) {
        error!(
            message = "Failed delivering merged event; buffer preserved for retry.",
            error = %self.error,
        );
        counter!("multiline_delivery_errors_total").increment(1);
    }
}

#[derive(Debug)]
pub(crate) struct IdentityCreated<'a> {
    pub identity: &'a str,
    pub total: usize,
}

impl InternalEvent for IdentityCreated<'_> {
    fn emit(self) {
        debug!(
            message = "Created assembler for new stream identity.",
            identity = self.identity,
            total = self.total,
        );
        counter!("multiline_identities_created_total").increment(1);
    }
}

#[derive(Debug)]
pub(crate) struct IdentityEvicted<'a> {
    pub identity: &'a str,
    pub reason: &'static str,
}

impl InternalEvent for IdentityEvicted<'_> {
    fn emit(self) {
        debug!(
            message = "Evicted stream identity.",
            identity = self.identity,
            reason = self.reason,
        );
        counter!("multiline_identities_evicted_total", "reason" => self.reason).increment(1);
    }
}

#[derive(Debug)]
pub(crate) struct IdentityMapHighWater {
    pub size: usize,
    pub max: usize,
}

impl InternalEvent for IdentityMapHighWater {
    fn emit(self) {
        warn!(
            message = "Identity map is over 80% of capacity.",
            size = self.size,
            max_identities = self.max,
        );
    }
}

#[derive(Debug)]
pub(crate) struct IdentityMapFull {
    pub max: usize,
}

impl InternalEvent for IdentityMapFull {
    fn emit(self) {
        error!(
            message = "Identity map is full; dropping stream.",
            max_identities = self.max,
        );
        counter!("multiline_identity_map_full_total").increment(1);
    }
}
