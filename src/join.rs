//! Joining the overlay through a bootstrap entry point.
//!
//! A peer without its own skip-graph node asks a bootstrap-resolved entry
//! point to admit it. An empty bootstrap pool, or an explicit answer that no
//! overlay exists, makes this peer the first node.

use std::time::Duration;

use tracing::debug;

use crate::identity::Contact;
use crate::messages::{Message, MessageBody, OperationId};
use crate::monitor::{JoinReport, OperationReport};
use crate::operation::{
    EntryPolicy, OperationError, OperationLogic, OperationStats, Progress, TrackerHandle,
};
use crate::protocols::LocalOverlay;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Admitted through `entry`.
    Joined { entry: Contact },
    /// No overlay exists yet; this peer starts one.
    FirstNode,
}

pub(crate) struct JoinOperation;

impl OperationLogic for JoinOperation {
    type Output = JoinOutcome;

    fn kind(&self) -> &'static str {
        "join"
    }

    fn entry_policy(&self) -> EntryPolicy {
        EntryPolicy::AlwaysBootstrap
    }

    fn check_precondition(&self, overlay: &dyn LocalOverlay) -> Result<(), OperationError> {
        if !overlay.is_online() {
            return Err(OperationError::NotOnline);
        }
        if overlay.local_entry_node().is_some() {
            return Err(OperationError::AlreadyJoined);
        }
        Ok(())
    }

    fn build_body(&self, _tracker: &TrackerHandle) -> MessageBody {
        MessageBody::JoinRequest
    }

    fn on_reply(&mut self, reply: &Message, stats: &mut OperationStats) -> Progress<JoinOutcome> {
        match reply.body {
            MessageBody::JoinAck => {
                stats.acks += 1;
                Progress::Done(JoinOutcome::Joined {
                    entry: reply.sender.clone(),
                })
            }
            MessageBody::JoinNack {
                overlay_reachable: false,
            } => Progress::Done(JoinOutcome::FirstNode),
            ref other => {
                debug!(op = reply.operation_id, body = other.name(), "join refused");
                Progress::Retry
            }
        }
    }

    fn on_empty_pool(&mut self) -> Option<JoinOutcome> {
        Some(JoinOutcome::FirstNode)
    }

    fn report(
        &self,
        id: OperationId,
        outcome: &Result<JoinOutcome, OperationError>,
        stats: &OperationStats,
        elapsed: Duration,
    ) -> OperationReport {
        OperationReport::Join(JoinReport {
            operation_id: id,
            success: outcome.is_ok(),
            duration: elapsed,
            first_node: matches!(outcome, Ok(JoinOutcome::FirstNode)),
            messages: stats.message_counts(),
            bootstrap_attempts: stats.bootstrap_attempts,
        })
    }
}
