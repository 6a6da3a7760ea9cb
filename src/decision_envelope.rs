// =============================================================================
// Decision envelope — auditable record of a webhook/strategy gate-check run
// =============================================================================
//
// Every inbound signal runs through an ordered sequence of gate checks before
// it is allowed to become an order intent. This struct captures the verdict
// of each gate so a rejected (or accepted) signal can be explained after the
// fact without re-running the pipeline.
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct GateVerdict {
    pub gate: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GateVerdict {
    pub fn pass(gate: impl Into<String>) -> Self {
        Self { gate: gate.into(), passed: true, detail: None }
    }

    pub fn fail(gate: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { gate: gate.into(), passed: false, detail: Some(detail.into()) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub gates: Vec<GateVerdict>,
    pub final_decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_gate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: String,
}

impl DecisionEnvelope {
    pub fn allow(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: impl Into<String>,
        gates: Vec<GateVerdict>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side: side.into(),
            gates,
            final_decision: "ALLOW".to_string(),
            blocking_gate: None,
            reason: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn blocked(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: impl Into<String>,
        gates: Vec<GateVerdict>,
        blocking_gate: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side: side.into(),
            gates,
            final_decision: "BLOCK".to_string(),
            blocking_gate: Some(blocking_gate.into()),
            reason: Some(reason.into()),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
