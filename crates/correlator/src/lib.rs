//! Request-to-action attribution.
//!
//! Four layers of evidence, strongest first: preflight inheritance, initiator
//! stack traces, timing plus semantic scoring, and temporal chaining onto an
//! already-attributed parent. The correlator is pure over snapshots; the owning
//! session applies the resulting attributions back onto the store.

pub mod chains;
mod scoring;

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use netlens_core_types::{
    config::ObserverConfig, ActionId, ActionKind, ActionRecord, Attribution, AttributionMethod,
    CorrelationResult, InitiatorKind, RequestId, RequestRecord, StackTrace,
};

use crate::chains::detect_chains;
use crate::scoring::score_candidate;

/// Small negative tolerance absorbing clock skew between request timestamps and
/// user-gesture timestamps.
const CLOCK_SKEW_TOLERANCE_MS: f64 = 10.0;

/// Parent-hop bound when walking async stacks; cyclic inputs cannot spin.
const MAX_ASYNC_DEPTH: u32 = 50;

/// Confidence assigned to preflight inheritance (layer 0).
const PREFLIGHT_CONFIDENCE: f64 = 0.85;

/// Confidence assigned to temporal chaining (layer 4).
const TEMPORAL_CHAIN_CONFIDENCE: f64 = 0.5;

/// Largest gap between a parent's end and a child's start for temporal chaining.
const TEMPORAL_CHAIN_GAP_MS: f64 = 100.0;

/// DOM event names that mark a frame as user-originated.
const USER_EVENT_NAMES: &[&str] = &[
    "click",
    "dblclick",
    "mousedown",
    "mouseup",
    "submit",
    "input",
    "change",
    "keydown",
    "keyup",
    "keypress",
    "touchstart",
    "touchend",
    "pointerdown",
    "pointerup",
    "focus",
    "blur",
];

pub struct Correlator {
    window_ms: f64,
    min_confidence: f64,
}

impl Correlator {
    pub fn new(config: &ObserverConfig) -> Self {
        Self {
            window_ms: config.max_correlation_window_ms,
            min_confidence: config.min_confidence,
        }
    }

    pub fn with_params(window_ms: f64, min_confidence: f64) -> Self {
        Self {
            window_ms,
            min_confidence,
        }
    }

    /// Best attribution for a single request given the current action log and
    /// request population. Deterministic for identical inputs; an attribution
    /// already on the record short-circuits.
    pub fn correlate_request(
        &self,
        request: &RequestRecord,
        actions: &[ActionRecord],
        all_requests: &[RequestRecord],
    ) -> Option<Attribution> {
        self.evaluate(request, actions, all_requests, &HashMap::new())
    }

    fn evaluate(
        &self,
        request: &RequestRecord,
        actions: &[ActionRecord],
        all_requests: &[RequestRecord],
        overlay: &HashMap<RequestId, Attribution>,
    ) -> Option<Attribution> {
        if let Some(existing) = &request.attribution {
            return Some(existing.clone());
        }

        if let Some(attribution) = self.preflight_inheritance(request, all_requests, overlay) {
            return Some(attribution);
        }
        if let Some(attribution) = self.stack_trace_match(request, actions) {
            return Some(attribution);
        }
        if let Some(attribution) = self.timing_semantic_match(request, actions) {
            return Some(attribution);
        }
        self.temporal_chain_match(request, all_requests, overlay)
    }

    /// Layer 0: a preflight inherits the attribution of the request it covers.
    fn preflight_inheritance(
        &self,
        request: &RequestRecord,
        all_requests: &[RequestRecord],
        overlay: &HashMap<RequestId, Attribution>,
    ) -> Option<Attribution> {
        if request.initiator.kind != InitiatorKind::Preflight {
            return None;
        }
        let target = request
            .initiator
            .target_request
            .as_ref()
            .or(request.preflight_for.as_ref())?;

        let target_attribution = overlay.get(target).cloned().or_else(|| {
            all_requests
                .iter()
                .find(|record| &record.id == target)
                .and_then(|record| record.attribution.clone())
        })?;

        Some(Attribution {
            action_id: target_attribution.action_id,
            confidence: PREFLIGHT_CONFIDENCE,
            method: AttributionMethod::Chain,
        })
    }

    /// Layer 1: walk the initiator stack for a user-event frame and match it
    /// against a compatible action inside the time window.
    fn stack_trace_match(
        &self,
        request: &RequestRecord,
        actions: &[ActionRecord],
    ) -> Option<Attribution> {
        let stack = request.initiator.stack.as_ref()?;
        let (event, depth) = user_event_in_stack(stack)?;

        let mut best: Option<(&ActionRecord, f64)> = None;
        for action in actions {
            if !event_compatible(&event, action.kind) {
                continue;
            }
            let delta = request.timing.start_ms - action.timestamp_ms;
            if !self.in_window(delta) {
                continue;
            }
            let distance = delta.abs();
            // Strict comparison keeps the earlier-created action on a tie.
            let better = match best {
                Some((_, best_distance)) => distance < best_distance,
                None => true,
            };
            if better {
                best = Some((action, distance));
            }
        }

        let (action, _) = best?;
        let confidence = (0.95 - 0.02 * f64::from(depth)).max(0.85);
        debug!(
            target: "correlator",
            request = %request.id,
            action = %action.id,
            event = %event,
            depth,
            "stack trace attribution"
        );
        Some(Attribution {
            action_id: action.id.clone(),
            confidence,
            method: AttributionMethod::StackTrace,
        })
    }

    /// Layers 2 and 3: score every in-window action on proximity and semantics.
    fn timing_semantic_match(
        &self,
        request: &RequestRecord,
        actions: &[ActionRecord],
    ) -> Option<Attribution> {
        let mut best: Option<(&ActionRecord, f64)> = None;
        for action in actions {
            let delta = request.timing.start_ms - action.timestamp_ms;
            if !self.in_window(delta) {
                continue;
            }
            let score = score_candidate(request, action);
            if score < self.min_confidence {
                continue;
            }
            let better = match best {
                Some((_, best_score)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((action, score));
            }
        }

        let (action, score) = best?;
        let method = if score >= 0.5 {
            AttributionMethod::TimingSemantic
        } else {
            AttributionMethod::TimingOnly
        };
        Some(Attribution {
            action_id: action.id.clone(),
            confidence: score,
            method,
        })
    }

    /// Layer 4: chain onto an already-attributed request that finished just
    /// before this one started.
    fn temporal_chain_match(
        &self,
        request: &RequestRecord,
        all_requests: &[RequestRecord],
        overlay: &HashMap<RequestId, Attribution>,
    ) -> Option<Attribution> {
        let mut parents: Vec<&RequestRecord> = all_requests
            .iter()
            .filter(|record| record.id != request.id && record.timing.end_ms.is_some())
            .collect();
        parents.sort_by(|a, b| {
            b.timing
                .end_ms
                .partial_cmp(&a.timing.end_ms)
                .unwrap_or(Ordering::Equal)
        });

        for parent in parents {
            let end_ms = parent.timing.end_ms.unwrap_or_default();
            let gap = request.timing.start_ms - end_ms;
            if gap < 0.0 {
                continue;
            }
            if gap > TEMPORAL_CHAIN_GAP_MS {
                break;
            }
            let attribution = overlay
                .get(&parent.id)
                .cloned()
                .or_else(|| parent.attribution.clone());
            if let Some(attribution) = attribution {
                return Some(Attribution {
                    action_id: attribution.action_id,
                    confidence: TEMPORAL_CHAIN_CONFIDENCE,
                    method: AttributionMethod::Chain,
                });
            }
        }
        None
    }

    fn in_window(&self, delta_ms: f64) -> bool {
        delta_ms >= -CLOCK_SKEW_TOLERANCE_MS && delta_ms <= self.window_ms
    }

    /// Evaluate requests in start order, making earlier decisions visible to
    /// later temporal-chain lookups in the same pass.
    fn assign(
        &self,
        requests: &[RequestRecord],
        actions: &[ActionRecord],
    ) -> HashMap<RequestId, Attribution> {
        let mut order: Vec<&RequestRecord> = requests.iter().collect();
        order.sort_by(|a, b| {
            a.timing
                .start_ms
                .partial_cmp(&b.timing.start_ms)
                .unwrap_or(Ordering::Equal)
        });

        let mut assigned = HashMap::new();
        for request in order {
            if let Some(attribution) = self.evaluate(request, actions, requests, &assigned) {
                assigned.insert(request.id.clone(), attribution);
            }
        }
        assigned
    }

    /// Collect the requests whose best match is `action_id`, detect chains, and
    /// aggregate confidence. `None` when nothing matched.
    pub fn correlate_action(
        &self,
        action_id: &ActionId,
        requests: &[RequestRecord],
        actions: &[ActionRecord],
    ) -> Option<CorrelationResult> {
        let action = actions.iter().find(|action| &action.id == action_id)?;
        let assigned = self.assign(requests, actions);
        self.finalize_group(action, requests, &assigned)
    }

    /// Attribute every request still lacking attribution, group by winning
    /// action, and finalize each group. Results sort by action timestamp.
    pub fn correlate_all(
        &self,
        requests: &[RequestRecord],
        actions: &[ActionRecord],
    ) -> Vec<CorrelationResult> {
        let assigned = self.assign(requests, actions);

        let mut winner_ids: Vec<ActionId> = Vec::new();
        for request in requests {
            if request.attribution.is_some() {
                continue;
            }
            if let Some(attribution) = assigned.get(&request.id) {
                if !winner_ids.contains(&attribution.action_id) {
                    winner_ids.push(attribution.action_id.clone());
                }
            }
        }

        let mut winners: Vec<&ActionRecord> = actions
            .iter()
            .filter(|action| winner_ids.contains(&action.id))
            .collect();
        winners.sort_by(|a, b| {
            a.timestamp_ms
                .partial_cmp(&b.timestamp_ms)
                .unwrap_or(Ordering::Equal)
        });

        winners
            .into_iter()
            .filter_map(|action| self.finalize_group(action, requests, &assigned))
            .collect()
    }

    fn finalize_group(
        &self,
        action: &ActionRecord,
        requests: &[RequestRecord],
        assigned: &HashMap<RequestId, Attribution>,
    ) -> Option<CorrelationResult> {
        let mut members: Vec<RequestRecord> = requests
            .iter()
            .filter_map(|request| {
                let attribution = assigned.get(&request.id)?;
                if attribution.action_id != action.id {
                    return None;
                }
                let mut member = request.clone();
                member.attribution = Some(attribution.clone());
                Some(member)
            })
            .collect();

        if members.is_empty() {
            return None;
        }
        members.sort_by(|a, b| {
            a.timing
                .start_ms
                .partial_cmp(&b.timing.start_ms)
                .unwrap_or(Ordering::Equal)
        });

        let confidence = members
            .iter()
            .filter_map(|member| member.attribution.as_ref())
            .map(|attribution| attribution.confidence)
            .sum::<f64>()
            / members.len() as f64;

        let chains = detect_chains(&members);

        let mut action = action.clone();
        action.resulting_request_ids = members.iter().map(|member| member.id.clone()).collect();

        Some(CorrelationResult {
            action,
            requests: members,
            chains,
            confidence,
        })
    }
}

/// Find the first user-event frame in a stack: the node itself, then async
/// parents, bounded by [`MAX_ASYNC_DEPTH`]. Returns the event name and the
/// number of parent hops traversed.
fn user_event_in_stack(stack: &StackTrace) -> Option<(String, u32)> {
    let mut node = Some(stack);
    let mut depth = 0u32;
    while let Some(current) = node {
        if depth > MAX_ASYNC_DEPTH {
            return None;
        }
        if let Some(description) = &current.description {
            let lowered = description.to_ascii_lowercase();
            if USER_EVENT_NAMES.contains(&lowered.as_str()) {
                return Some((lowered, depth));
            }
        }
        node = current.parent.as_deref();
        depth += 1;
    }
    None
}

/// Which recorded action kinds a user-event frame can explain.
fn event_compatible(event: &str, kind: ActionKind) -> bool {
    match event {
        "click" => kind == ActionKind::Click,
        "submit" => matches!(kind, ActionKind::Submit | ActionKind::Navigate),
        "input" | "change" | "keydown" => kind == ActionKind::Type,
        _ => false,
    }
}
