use std::sync::Arc;

use crate::channel::NodeChannel;
use crate::driver::DriverContext;
use crate::handler::resubmit_unit;
use crate::scheduler::job::ReturnReason;

/// Close a channel and recover the units it held.
///
/// Used for I/O errors, unexpected disconnects and deliberate closes alike.
/// Only the first call for a channel does anything. Every in-flight unit has
/// its expiration timer cancelled and is resubmitted: whole and uncounted by
/// default, or task by task under the resubmit limit when the job's SLA sets
/// `apply_max_resubmits_upon_node_error`.
pub async fn handle_channel_failure(ctx: &DriverContext, channel: &Arc<NodeChannel>, reason: &str) {
    let (units, keep_reservation) = {
        let mut state = channel.lock().await;
        if !channel.close(&mut state) {
            return;
        }
        (channel.take_entries(&mut state), state.keep_reservation)
    };

    if ctx.unregister(channel).await && channel.identity().is_some() {
        ctx.stats.node_disconnected(channel.is_peer());
    }
    if !keep_reservation {
        ctx.reservations.remove_reservation(channel.uuid()).await;
    }

    if units.is_empty() {
        tracing::info!(channel = %channel.id(), node = %channel.uuid(), reason, "Node channel closed");
        return;
    }
    tracing::warn!(
        channel = %channel.id(),
        node = %channel.uuid(),
        reason,
        in_flight = units.len(),
        "Node channel failed with units in flight"
    );
    for unit in units {
        ctx.expirations.cancel_action(&unit.key()).await;
        unit.set_return_reason(ReturnReason::NodeChannelError);
        let counted = unit.job().sla().apply_max_resubmits_upon_node_error;
        resubmit_unit(ctx, &unit, counted).await;
    }
}
