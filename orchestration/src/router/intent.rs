//! Intent model and parsing of classifier output.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::events::{agent_topic, Payload};

/// Action and target used when classifier output cannot be understood.
pub const UNKNOWN: &str = "unknown";

/// Confidence assigned to fallback intents.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

/// Structured interpretation of one free-form command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Payload,
    pub confidence: f64,
    pub raw_input: String,
    pub context_id: String,
}

impl Intent {
    /// Low-confidence placeholder for input the classifier could not handle.
    pub fn unknown(raw_input: &str, context_id: &str) -> Self {
        Self {
            action: UNKNOWN.to_string(),
            target: UNKNOWN.to_string(),
            parameters: Payload::new(),
            confidence: FALLBACK_CONFIDENCE,
            raw_input: raw_input.to_string(),
            context_id: context_id.to_string(),
        }
    }

    /// Bus topic this intent is routed to.
    pub fn topic(&self) -> String {
        agent_topic(&self.target, &self.action)
    }
}

/// Classifier verdict: either safe to route or needs clarification.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Confident(Intent),
    LowConfidence(Intent),
}

impl Classification {
    /// Gate an intent on `threshold`. Confidence equal to the threshold
    /// is routable.
    pub fn gate(intent: Intent, threshold: f64) -> Self {
        if intent.confidence < threshold {
            Self::LowConfidence(intent)
        } else {
            Self::Confident(intent)
        }
    }

    pub fn intent(&self) -> &Intent {
        match self {
            Self::Confident(i) | Self::LowConfidence(i) => i,
        }
    }

    pub fn into_intent(self) -> Intent {
        match self {
            Self::Confident(i) | Self::LowConfidence(i) => i,
        }
    }

    pub fn is_confident(&self) -> bool {
        matches!(self, Self::Confident(_))
    }
}

#[derive(Deserialize)]
struct ClassifierOutput {
    action: Option<String>,
    target: Option<String>,
    #[serde(default)]
    parameters: Option<Payload>,
    confidence: Option<f64>,
}

/// Slice of `text` from the first `open` to the last `close`, inclusive.
pub(crate) fn delimited(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse model output into an [`Intent`].
///
/// Never fails: anything unparseable, or missing an action or target,
/// becomes [`Intent::unknown`].
pub fn parse_intent(response: &str, raw_input: &str, context_id: &str) -> Intent {
    let parsed = delimited(response, '{', '}')
        .ok_or_else(|| "no JSON object in model output".to_string())
        .and_then(|json| serde_json::from_str::<ClassifierOutput>(json).map_err(|e| e.to_string()));

    let output = match parsed {
        Ok(output) => output,
        Err(reason) => {
            warn!(
                reason = %reason,
                input = raw_input,
                "Intent classification unparseable, falling back"
            );
            return Intent::unknown(raw_input, context_id);
        }
    };

    let action = output.action.filter(|s| !s.trim().is_empty());
    let target = output.target.filter(|s| !s.trim().is_empty());
    let (Some(action), Some(target)) = (action, target) else {
        warn!(input = raw_input, "Classifier output missing action or target, falling back");
        return Intent::unknown(raw_input, context_id);
    };

    Intent {
        action: action.trim().to_lowercase(),
        target: target.trim().to_lowercase(),
        parameters: output.parameters.unwrap_or_default(),
        confidence: output.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        raw_input: raw_input.to_string(),
        context_id: context_id.to_string(),
    }
}
