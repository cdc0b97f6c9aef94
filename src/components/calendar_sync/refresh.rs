use futures::TryStreamExt;
use tracing::{debug, warn};

use super::event_store::{EventStore, ReconcileStats};
use crate::error::ProviderError;
use crate::models::DateRange;
use crate::traits::ProviderClient;

/// Pull `range` from the provider and reconcile it into `store`.
///
/// Cached masters whose series reaches into the range are re-read one by
/// one, since listings never contain them.
pub async fn refresh_range(
    provider: &dyn ProviderClient,
    store: &EventStore,
    range: DateRange,
) -> Result<ReconcileStats, ProviderError> {
    let snapshot = store.snapshot();
    let listing: Vec<_> = provider.list_events(range).try_collect().await?;
    let listed = listing.len();
    let mut stats = store.reconcile(&snapshot, listing, &range);

    for master in store.masters() {
        if master.start() >= range.end {
            continue;
        }
        let version = snapshot.version(&master.id) + 1;
        match provider.get_event(&master.id).await {
            Ok(current) if current == master => {}
            Ok(current) => {
                if store.upsert(current, version) {
                    stats.upserted += 1;
                } else {
                    stats.rejected += 1;
                }
            }
            Err(ProviderError::NotFound(_)) => {
                if store.remove(&master.id, version) {
                    stats.removed += 1;
                } else {
                    stats.rejected += 1;
                }
            }
            Err(err @ ProviderError::AuthExpired(_)) => return Err(err),
            Err(err) => warn!("Could not re-check series {}: {}", master.id, err),
        }
    }

    debug!(
        "Refreshed {}: {} listed, {} upserted, {} removed, {} rejected",
        range, listed, stats.upserted, stats.removed, stats.rejected
    );
    Ok(stats)
}
