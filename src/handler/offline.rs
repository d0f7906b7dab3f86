//! Offline nodes take a unit, disconnect, and come back later with the
//! results. In between, the unit waits in the [`OfflineHolder`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::channel::NodeChannel;
use crate::driver::DriverContext;
use crate::handler::failure::handle_channel_failure;
use crate::handler::results::handle_result;
use crate::scheduler::job::{BundleKey, DispatchUnit};
use crate::transport::message::ReopenInfo;

#[derive(Debug, Default)]
pub struct OfflineHolder {
    units: Mutex<HashMap<BundleKey, Arc<DispatchUnit>>>,
}

impl OfflineHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, unit: Arc<DispatchUnit>) {
        self.units.lock().await.insert(unit.key(), unit);
    }

    pub async fn remove(&self, key: &BundleKey) -> Option<Arc<DispatchUnit>> {
        self.units.lock().await.remove(key)
    }

    pub async fn contains(&self, key: &BundleKey) -> bool {
        self.units.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.units.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.units.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<BundleKey> {
        let mut keys: Vec<BundleKey> = self.units.lock().await.keys().copied().collect();
        keys.sort();
        keys
    }
}

/// Post-send step for offline channels: the unit moves to the holder and the
/// connection is closed. The unit is no longer in flight on the channel, so
/// closing it does not resubmit anything.
pub async fn hand_over(ctx: &DriverContext, channel: &Arc<NodeChannel>, unit: Arc<DispatchUnit>) {
    let key = unit.key();
    {
        let mut state = channel.lock().await;
        channel.remove_entry(&mut state, &key);
    }
    ctx.offline.add(unit).await;
    tracing::info!(node = %channel.uuid(), bundle = %key, "Unit handed to offline node");
    handle_channel_failure(ctx, channel, "offline node took its unit").await;
}

/// A reconnecting offline node delivers the results of a held unit.
///
/// Runs during the handshake, before the channel is active, so the unit
/// briefly re-enters the channel's in-flight map and then goes through the
/// normal result path.
pub async fn reopen(ctx: &DriverContext, channel: &Arc<NodeChannel>, info: ReopenInfo, results: Vec<Bytes>) {
    let key = BundleKey::new(info.result.job_uuid, info.result.bundle_id);
    let Some(unit) = ctx.offline.remove(&key).await else {
        tracing::warn!(node = %channel.uuid(), bundle = %key, "Offline node returned an unknown unit");
        return;
    };
    {
        let mut state = channel.lock().await;
        channel.add_entry(&mut state, unit);
    }
    tracing::info!(node = %channel.uuid(), bundle = %key, "Offline node delivered results");
    handle_result(ctx, channel, info.result, results).await;
}
