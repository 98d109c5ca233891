// =============================================================================
// BrokerFilter — static eligibility check ahead of order placement
// =============================================================================
//
// A small, synchronous gate the Executor consults before it ever reaches the
// broker or RiskAuthority: is this agent's broker/category combination even
// allowed to trade this symbol. Kept separate from `SignalValidator` because
// it depends on the `Agent` record (not just the candidate signal) and from
// `RiskAuthority` because it never touches a lock or the network.
// =============================================================================

use crate::statestore::model::Agent;
use crate::types::{Broker, Category};

pub struct BrokerFilter {
    /// Symbols each broker is configured to trade. A broker absent from this
    /// map is treated as accepting any symbol.
    allowed_symbols: std::collections::HashMap<Broker, Vec<String>>,
}

impl BrokerFilter {
    pub fn new(allowed_symbols: std::collections::HashMap<Broker, Vec<String>>) -> Self {
        Self { allowed_symbols }
    }

    /// `true` iff `agent` is active, its category permits `category`, and its
    /// broker is configured to trade `symbol`.
    pub fn can_execute(&self, agent: &Agent, symbol: &str, category: Category) -> (bool, Option<String>) {
        if !agent.is_active {
            return (false, Some("agent is not active".to_string()));
        }

        if !agent.allowed_signal_categories.contains(&category) {
            return (false, Some(format!("agent does not permit category {category:?}")));
        }

        if let Some(symbols) = self.allowed_symbols.get(&agent.broker) {
            if !symbols.iter().any(|s| s == symbol) {
                return (false, Some(format!("{} is not configured to trade {symbol}", agent.broker)));
            }
        }

        (true, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(broker: Broker, active: bool, categories: Vec<Category>) -> Agent {
        Agent {
            id: "agent-1".to_string(),
            user_id: "user-1".to_string(),
            broker,
            category: Category::FibonacciScalping,
            is_active: active,
            allowed_signal_categories: categories,
        }
    }

    #[test]
    fn rejects_inactive_agent() {
        let filter = BrokerFilter::new(std::collections::HashMap::new());
        let a = agent(Broker::Mt4, false, vec![Category::FibonacciScalping]);
        let (ok, _) = filter.can_execute(&a, "BTCUSD", Category::FibonacciScalping);
        assert!(!ok);
    }

    #[test]
    fn rejects_disallowed_category() {
        let filter = BrokerFilter::new(std::collections::HashMap::new());
        let a = agent(Broker::Mt4, true, vec![Category::Momentum]);
        let (ok, reason) = filter.can_execute(&a, "BTCUSD", Category::FibonacciScalping);
        assert!(!ok);
        assert!(reason.unwrap().contains("category"));
    }

    #[test]
    fn rejects_unconfigured_symbol() {
        let mut map = std::collections::HashMap::new();
        map.insert(Broker::Okx, vec!["ETHUSD".to_string()]);
        let filter = BrokerFilter::new(map);
        let a = agent(Broker::Okx, true, vec![Category::FibonacciScalping]);
        let (ok, _) = filter.can_execute(&a, "BTCUSD", Category::FibonacciScalping);
        assert!(!ok);
    }

    #[test]
    fn accepts_when_everything_lines_up() {
        let mut map = std::collections::HashMap::new();
        map.insert(Broker::Mt4, vec!["BTCUSD".to_string()]);
        let filter = BrokerFilter::new(map);
        let a = agent(Broker::Mt4, true, vec![Category::FibonacciScalping]);
        let (ok, _) = filter.can_execute(&a, "BTCUSD", Category::FibonacciScalping);
        assert!(ok);
    }

    #[test]
    fn broker_absent_from_map_accepts_any_symbol() {
        let filter = BrokerFilter::new(std::collections::HashMap::new());
        let a = agent(Broker::Binance, true, vec![Category::Momentum]);
        let (ok, _) = filter.can_execute(&a, "ANYTHING", Category::Momentum);
        assert!(ok);
    }
}
