// =============================================================================
// Symbol resolver — (openalgo-symbol, exchange) -> broker symbol record
// =============================================================================
//
// The active table is a snapshot behind `parking_lot::RwLock`: readers clone
// an `Arc` out, writers build the new table off to the side and swap the
// whole thing in atomically so no reader ever sees a partially updated table.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Instrument classification, used for lot-size/freeze-limit lookups and
/// order-type gating downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentType {
    Equity,
    Future,
    Option,
    Index,
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "equity"),
            Self::Future => write!(f, "future"),
            Self::Option => write!(f, "option"),
            Self::Index => write!(f, "index"),
        }
    }
}

/// Immutable per-trading-day symbol record. Never mutated in place — a
/// `rotate` replaces the whole table atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub openalgo_symbol: String,
    pub exchange: String,
    pub broker_symbol: String,
    /// Opaque broker token (instrument identifier on the wire).
    pub broker_token: String,
    pub instrument_type: InstrumentType,
    pub lot_size: u32,
    pub tick_size: f64,
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SymbolKey {
    openalgo_symbol: String,
    exchange: String,
}

#[derive(Default)]
struct SymbolTable {
    by_symbol: HashMap<SymbolKey, SymbolRecord>,
    /// Reverse index: (broker token, exchange) -> record, for fills/quotes
    /// that only carry the broker's own identifier.
    by_token: HashMap<(String, String), SymbolRecord>,
}

/// Batched, snapshot-swap symbol resolver.
pub struct SymbolResolver {
    table: RwLock<Arc<SymbolTable>>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(SymbolTable::default())),
        }
    }

    /// Resolve a single (symbol, exchange) pair against the current snapshot.
    pub fn resolve(&self, symbol: &str, exchange: &str) -> Option<SymbolRecord> {
        let snapshot = self.table.read().clone();
        snapshot
            .by_symbol
            .get(&SymbolKey {
                openalgo_symbol: symbol.to_string(),
                exchange: exchange.to_string(),
            })
            .cloned()
    }

    /// Batched resolution: callers placing basket orders should call this
    /// rather than looping `resolve`. The whole table lives in one
    /// in-process snapshot, so a batched query degenerates to a single
    /// snapshot read followed by per-key lookups with no additional I/O.
    pub fn resolve_many(&self, pairs: &[(String, String)]) -> HashMap<(String, String), SymbolRecord> {
        let snapshot = self.table.read().clone();
        let mut out = HashMap::with_capacity(pairs.len());
        for (symbol, exchange) in pairs {
            if let Some(rec) = snapshot.by_symbol.get(&SymbolKey {
                openalgo_symbol: symbol.clone(),
                exchange: exchange.clone(),
            }) {
                out.insert((symbol.clone(), exchange.clone()), rec.clone());
            }
        }
        out
    }

    /// Reverse lookup by broker token, used when normalising broker fill
    /// callbacks that only carry the broker's own identifier.
    pub fn reverse(&self, token: &str, exchange: &str) -> Option<SymbolRecord> {
        let snapshot = self.table.read().clone();
        snapshot
            .by_token
            .get(&(token.to_string(), exchange.to_string()))
            .cloned()
    }

    /// All option records for `underlying` on `exchange` with the given
    /// expiry (or any expiry if `expiry` is `None`).
    pub fn options_chain(
        &self,
        underlying: &str,
        exchange: &str,
        expiry: Option<&str>,
    ) -> Vec<SymbolRecord> {
        let snapshot = self.table.read().clone();
        snapshot
            .by_symbol
            .values()
            .filter(|r| {
                r.instrument_type == InstrumentType::Option
                    && r.exchange == exchange
                    && r.openalgo_symbol.starts_with(underlying)
                    && expiry.map(|e| r.expiry.as_deref() == Some(e)).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Atomically replace the entire table for `broker` with a freshly
    /// downloaded master contract. On failure to build a valid table the
    /// previous snapshot stays active; callers are expected to have already
    /// validated `records` before calling (a rotation failure upstream, e.g.
    /// the master-contract source being unavailable, should simply not call
    /// `rotate` at all and keep serving the old table).
    pub fn rotate(&self, broker: &str, records: Vec<SymbolRecord>) {
        let mut by_symbol = HashMap::with_capacity(records.len());
        let mut by_token = HashMap::with_capacity(records.len());

        for rec in records {
            by_symbol.insert(
                SymbolKey {
                    openalgo_symbol: rec.openalgo_symbol.clone(),
                    exchange: rec.exchange.clone(),
                },
                rec.clone(),
            );
            by_token.insert((rec.broker_token.clone(), rec.exchange.clone()), rec);
        }

        let count = by_symbol.len();
        let checksum = simple_checksum(by_symbol.keys());
        let new_table = Arc::new(SymbolTable { by_symbol, by_token });

        *self.table.write() = new_table;
        info!(broker, contract_count = count, checksum, "symbol table rotated");
    }

    /// Case-insensitive substring search over symbol names, optionally
    /// narrowed to one exchange. Bounded to keep REST responses small.
    pub fn search(&self, query: &str, exchange: Option<&str>, limit: usize) -> Vec<SymbolRecord> {
        let needle = query.to_uppercase();
        let snapshot = self.table.read().clone();
        snapshot
            .by_symbol
            .values()
            .filter(|r| {
                r.openalgo_symbol.to_uppercase().contains(&needle)
                    && exchange.map(|e| r.exchange == e).unwrap_or(true)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn simple_checksum<'a>(keys: impl Iterator<Item = &'a SymbolKey>) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    let mut items: Vec<String> = keys
        .map(|k| format!("{}:{}", k.openalgo_symbol, k.exchange))
        .collect();
    items.sort();
    for item in items {
        item.hash(&mut hasher);
    }
    hasher.finish()
}

/// Build an instrument's broker-facing wire symbol in the bit-exact wire
/// format. `expiry_ddmmmyy` is e.g. `27JAN26`; `strike` only applies to
/// options.
pub fn format_wire_symbol(
    base: &str,
    instrument_type: InstrumentType,
    expiry_ddmmmyy: Option<&str>,
    strike: Option<u64>,
    is_call: Option<bool>,
) -> String {
    match instrument_type {
        InstrumentType::Equity | InstrumentType::Index => base.to_string(),
        InstrumentType::Future => {
            format!("{base}{}FUT", expiry_ddmmmyy.unwrap_or_default())
        }
        InstrumentType::Option => {
            let cp = match is_call {
                Some(true) => "CE",
                Some(false) => "PE",
                None => "",
            };
            format!(
                "{base}{}{}{cp}",
                expiry_ddmmmyy.unwrap_or_default(),
                strike.unwrap_or_default()
            )
        }
    }
}

/// Warn-and-report helper for lookup-miss callers.
pub fn lookup_miss(symbol: &str, exchange: &str) -> crate::error::EngineError {
    warn!(symbol, exchange, "symbol lookup miss");
    crate::error::EngineError::SymbolNotFound(format!("{symbol}/{exchange}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(symbol: &str, exchange: &str, token: &str) -> SymbolRecord {
        SymbolRecord {
            openalgo_symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            broker_symbol: symbol.to_string(),
            broker_token: token.to_string(),
            instrument_type: InstrumentType::Equity,
            lot_size: 1,
            tick_size: 0.05,
            expiry: None,
        }
    }

    #[test]
    fn resolve_miss_on_empty_table() {
        let r = SymbolResolver::new();
        assert!(r.resolve("RELIANCE", "NSE").is_none());
    }

    #[test]
    fn rotate_then_resolve() {
        let r = SymbolResolver::new();
        r.rotate("broker-a", vec![rec("RELIANCE", "NSE", "tok-1")]);
        let found = r.resolve("RELIANCE", "NSE").unwrap();
        assert_eq!(found.broker_token, "tok-1");
    }

    #[test]
    fn resolve_many_is_batched_and_partial() {
        let r = SymbolResolver::new();
        r.rotate(
            "broker-a",
            vec![rec("RELIANCE", "NSE", "t1"), rec("INFY", "NSE", "t2")],
        );
        let pairs = vec![
            ("RELIANCE".to_string(), "NSE".to_string()),
            ("UNKNOWN".to_string(), "NSE".to_string()),
        ];
        let out = r.resolve_many(&pairs);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key(&("RELIANCE".to_string(), "NSE".to_string())));
    }

    #[test]
    fn reverse_lookup_by_token() {
        let r = SymbolResolver::new();
        r.rotate("broker-a", vec![rec("TCS", "NSE", "tok-tcs")]);
        let rec = r.reverse("tok-tcs", "NSE").unwrap();
        assert_eq!(rec.openalgo_symbol, "TCS");
    }

    #[test]
    fn rotate_is_atomic_swap_not_partial_update() {
        let r = SymbolResolver::new();
        r.rotate("broker-a", vec![rec("A", "NSE", "1")]);
        assert!(r.resolve("A", "NSE").is_some());
        // A second rotation with a disjoint set must fully replace, not merge.
        r.rotate("broker-a", vec![rec("B", "NSE", "2")]);
        assert!(r.resolve("A", "NSE").is_none());
        assert!(r.resolve("B", "NSE").is_some());
    }

    #[test]
    fn wire_symbol_formats_match_spec() {
        assert_eq!(
            format_wire_symbol("RELIANCE", InstrumentType::Equity, None, None, None),
            "RELIANCE"
        );
        assert_eq!(
            format_wire_symbol("NIFTY", InstrumentType::Future, Some("27JAN26"), None, None),
            "NIFTY27JAN26FUT"
        );
        assert_eq!(
            format_wire_symbol(
                "NIFTY",
                InstrumentType::Option,
                Some("27JAN26"),
                Some(24000),
                Some(true)
            ),
            "NIFTY27JAN2624000CE"
        );
    }

    #[test]
    fn options_chain_filters_by_underlying_and_expiry() {
        let r = SymbolResolver::new();
        let mut opt = rec("NIFTY27JAN2624000CE", "NFO", "o1");
        opt.instrument_type = InstrumentType::Option;
        opt.expiry = Some("27JAN26".to_string());
        r.rotate("broker-a", vec![opt]);
        let chain = r.options_chain("NIFTY", "NFO", Some("27JAN26"));
        assert_eq!(chain.len(), 1);
        assert!(r.options_chain("NIFTY", "NFO", Some("03FEB26")).is_empty());
    }
}
