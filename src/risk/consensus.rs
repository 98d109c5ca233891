// =============================================================================
// Consensus evaluation — the 4-voter decision table
// =============================================================================
//
// A pure function deliberately kept separate from `RiskAuthority`'s lock
// discipline: it touches no store and no lock, so it is tested as plain
// arithmetic over the (buy, sell, hold, confidence) tuple.
// =============================================================================

use crate::types::Side;

/// Minimum confidence (0-100) required to accept a 2-0-2 / 0-2-2 split.
const MIN_CONFIDENCE_FOR_WEAK: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub should_trade: bool,
    pub direction: Option<Side>,
    pub size_multiplier: f64,
    pub pattern: String,
    pub reason: Option<String>,
}

fn reject(pattern: &str, reason: &str) -> ConsensusOutcome {
    ConsensusOutcome {
        should_trade: false,
        direction: None,
        size_multiplier: 0.0,
        pattern: pattern.to_string(),
        reason: Some(reason.to_string()),
    }
}

fn accept(pattern: &str, direction: Side, size_multiplier: f64) -> ConsensusOutcome {
    ConsensusOutcome {
        should_trade: true,
        direction: Some(direction),
        size_multiplier,
        pattern: pattern.to_string(),
        reason: None,
    }
}

/// Evaluates the 4-voter decision table from SPEC_FULL.md §4.1.
/// `hold ≥ 3` always rejects regardless of the buy/sell split.
pub fn evaluate_consensus(buy: u8, sell: u8, hold: u8, confidence: f64) -> ConsensusOutcome {
    let pattern = format!("{buy}-{sell}-{hold}");

    if hold >= 3 {
        return reject(&pattern, "uncertainty: 3 or more HOLD votes");
    }

    match (buy, sell, hold) {
        (4, 0, 0) => accept(&pattern, Side::Buy, 1.00),
        (0, 4, 0) => accept(&pattern, Side::Sell, 1.00),
        (3, 0, 1) => accept(&pattern, Side::Buy, 1.00),
        (0, 3, 1) => accept(&pattern, Side::Sell, 1.00),
        (3, 1, 0) => accept(&pattern, Side::Buy, 0.75),
        (1, 3, 0) => accept(&pattern, Side::Sell, 0.75),
        (2, 0, 2) => {
            if confidence >= MIN_CONFIDENCE_FOR_WEAK {
                accept(&pattern, Side::Buy, 0.50)
            } else {
                reject(&pattern, "confidence below threshold for weak consensus")
            }
        }
        (0, 2, 2) => {
            if confidence >= MIN_CONFIDENCE_FOR_WEAK {
                accept(&pattern, Side::Sell, 0.50)
            } else {
                reject(&pattern, "confidence below threshold for weak consensus")
            }
        }
        (2, 2, 0) => reject(&pattern, "tie"),
        (2, 1, 1) | (1, 2, 1) => reject(&pattern, "opposition and uncertainty"),
        (1, 1, _) => reject(&pattern, "split vote"),
        _ if buy >= 1 && sell == 0 && hold == 0 => reject(&pattern, "insufficient votes"),
        _ if sell >= 1 && buy == 0 && hold == 0 => reject(&pattern, "insufficient votes"),
        _ => reject(&pattern, "no consensus pattern matched"),
    }
}
