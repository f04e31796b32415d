use std::collections::HashMap;

use super::ProjectId;
use super::detector::{TrendPayload, TrendSettings, TrendState, TrendType, compute_new_trend_states};
use super::store::TrendStateStore;
use crate::internal_event::{InternalEvent, TrendClassified};
use crate::store::{KeyedStore, StoreError};

/// Runs the detector over one project's payloads.
///
/// Payloads must already be in timestamp order per entity. Prior states are read in
/// one round trip and the new states written back in another; a stale payload
/// leaves its entity's stored state untouched. When an entity appears more than once
/// the later payload builds on the state produced by the earlier one.
///
/// Returns the payloads that regressed and those that improved. Store errors are
/// returned as-is and nothing is written in that case.
pub async fn process_trend_payloads<S>(
    settings: &TrendSettings,
    project_id: ProjectId,
    payloads: &[TrendPayload],
    store: &TrendStateStore<S>,
) -> Result<(Vec<TrendPayload>, Vec<TrendPayload>), StoreError>
where
    S: KeyedStore + ?Sized,
{
    let mut regressed = Vec::new();
    let mut improved = Vec::new();
    if payloads.is_empty() {
        return Ok((regressed, improved));
    }

    let old_states = store.bulk_read_states(project_id, payloads).await?;
    let mut new_states: Vec<Option<TrendState>> = Vec::with_capacity(payloads.len());
    let mut latest: HashMap<&str, usize> = HashMap::new();

    for (index, (payload, old_state)) in payloads.iter().zip(&old_states).enumerate() {
        let cur_state = latest
            .get(payload.group.as_str())
            .and_then(|&earlier| new_states[earlier].as_ref())
            .unwrap_or(old_state);

        let Some((new_state, trend)) = compute_new_trend_states(settings, cur_state, payload) else {
            new_states.push(None);
            continue;
        };

        TrendClassified {
            kind: store.settings().kind.as_str(),
            trend,
        }
        .emit();

        match trend {
            TrendType::Regressed => regressed.push(payload.clone()),
            TrendType::Improved => improved.push(payload.clone()),
            TrendType::Unchanged => {}
        }

        new_states.push(Some(new_state));
        latest.insert(payload.group.as_str(), index);
    }

    let written = store.bulk_write_states(project_id, payloads, &new_states).await?;
    debug!(
        target: "dynamic_sampling::trends",
        project_id,
        payloads = payloads.len(),
        written,
        regressed = regressed.len(),
        improved = improved.len(),
        "Processed trend payloads"
    );

    Ok((regressed, improved))
}
