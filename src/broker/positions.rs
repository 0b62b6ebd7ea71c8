/// Position snapshot adapter
///
/// Brokerage position payloads are not consistent about field names:
/// some endpoints say `quantity`/`average_cost`, others `qty`/`avg_cost`,
/// and numbers frequently arrive as strings. The ambiguity stops here;
/// the rest of the system only ever sees this one shape.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionSnapshot {
    pub qty: f64,
    pub avg_cost: f64,
}

impl PositionSnapshot {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.qty > 0.0
    }
}

fn num_field(obj: &Value, names: &[&str]) -> f64 {
    for name in names {
        match &obj[*name] {
            Value::Number(n) => return n.as_f64().unwrap_or(0.0),
            Value::String(s) => {
                if let Ok(v) = s.parse::<f64>() {
                    return v;
                }
            }
            _ => {}
        }
    }
    0.0
}

fn symbol_field(obj: &Value) -> Option<&str> {
    obj["symbol"].as_str().or_else(|| obj["pair"].as_str())
}

/// Find `symbol` in a broker position listing and collapse it into a
/// snapshot. An absent entry is a legitimate flat position, not an error.
pub fn snapshot_from_listing(symbol: &str, listing: &Value) -> PositionSnapshot {
    let Some(items) = listing.as_array() else {
        return PositionSnapshot::flat();
    };
    for item in items {
        if symbol_field(item) == Some(symbol) {
            return PositionSnapshot {
                qty: num_field(item, &["quantity", "qty"]),
                avg_cost: num_field(item, &["average_cost", "avg_cost"]),
            };
        }
    }
    PositionSnapshot::flat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_long_field_names() {
        let listing = json!([{"symbol": "BTC-USD", "quantity": "0.0123", "average_cost": "52000.00"}]);
        let snap = snapshot_from_listing("BTC-USD", &listing);
        assert!((snap.qty - 0.0123).abs() < 1e-12);
        assert!((snap.avg_cost - 52_000.0).abs() < 1e-9);
        assert!(snap.is_held());
    }

    #[test]
    fn test_short_field_names_and_numbers() {
        let listing = json!([{"pair": "ETH-USD", "qty": 2.5, "avg_cost": 3100.0}]);
        let snap = snapshot_from_listing("ETH-USD", &listing);
        assert_eq!(snap.qty, 2.5);
        assert_eq!(snap.avg_cost, 3100.0);
    }

    #[test]
    fn test_missing_symbol_is_flat() {
        let listing = json!([{"symbol": "AAPL", "quantity": 10}]);
        let snap = snapshot_from_listing("MSFT", &listing);
        assert_eq!(snap, PositionSnapshot::flat());
        assert!(!snap.is_held());
    }

    #[test]
    fn test_garbage_listing_is_flat() {
        assert_eq!(
            snapshot_from_listing("AAPL", &json!({"not": "an array"})),
            PositionSnapshot::flat()
        );
    }
}
