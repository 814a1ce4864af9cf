//! Log filters, factory filters, and the fragments intervals are recorded against.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::types::Log;

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Where a factory creation log carries the child contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChildAddressLocation {
    /// Indexed topic 1, 2 or 3 (the address is the low 20 bytes).
    Topic(usize),
    /// Non-indexed data, at this byte offset of a 32-byte word.
    Offset(usize),
}

impl ChildAddressLocation {
    /// Extract the lowercase child address from a creation log.
    pub fn extract(&self, log: &Log) -> Option<String> {
        let word = match self {
            Self::Topic(index) => log.topics.get(*index)?.strip_prefix("0x")?,
            Self::Offset(offset) => {
                let data = log.data.strip_prefix("0x")?;
                data.get(offset * 2..offset * 2 + 64)?
            }
        };
        let address = word.get(24..64)?;
        Some(format!("0x{}", address.to_ascii_lowercase()))
    }
}

impl fmt::Display for ChildAddressLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(i) => write!(f, "topic{i}"),
            Self::Offset(o) => write!(f, "offset{o}"),
        }
    }
}

impl FromStr for ChildAddressLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(index) = s.strip_prefix("topic") {
            match index.parse::<usize>() {
                Ok(i @ 1..=3) => Ok(Self::Topic(i)),
                _ => Err(format!("invalid child address topic: {s}")),
            }
        } else if let Some(offset) = s.strip_prefix("offset") {
            offset
                .parse::<usize>()
                .map(Self::Offset)
                .map_err(|_| format!("invalid child address offset: {s}"))
        } else {
            Err(format!("invalid child address location: {s}"))
        }
    }
}

impl TryFrom<String> for ChildAddressLocation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChildAddressLocation> for String {
    fn from(value: ChildAddressLocation) -> Self {
        value.to_string()
    }
}

/// A contract whose creation events announce the addresses a filter should follow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Factory {
    /// The factory contract.
    pub address: String,
    /// topic0 of the creation event.
    pub event_selector: String,
    pub child_address_location: ChildAddressLocation,
}

impl Factory {
    /// Stable identifier, used as the key of child-address sets.
    pub fn id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.address.to_ascii_lowercase(),
            self.event_selector.to_ascii_lowercase(),
            self.child_address_location
        )
    }

    /// Returns `true` if `log` is one of this factory's creation events.
    pub fn is_creation_log(&self, log: &Log) -> bool {
        log.address.eq_ignore_ascii_case(&self.address)
            && log
                .topic0()
                .is_some_and(|t| t.eq_ignore_ascii_case(&self.event_selector))
    }

    /// Child address announced by a creation log, if it is one.
    pub fn child_address(&self, log: &Log) -> Option<String> {
        if !self.is_creation_log(log) {
            return None;
        }
        self.child_address_location.extract(log)
    }
}

// ─── LogFilter ───────────────────────────────────────────────────────────────

/// Which emitters a filter accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LogAddress {
    /// Any emitter.
    Any,
    /// A fixed list of contracts.
    Static(Vec<String>),
    /// Children announced by a factory.
    Factory(Factory),
}

/// One interval-tracking unit of a filter.
///
/// A filter is split into fragments (one per address × topic0 combination) so
/// that filters sharing a fragment share its synced intervals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
}

/// A log filter on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub chain_id: u64,
    pub address: LogAddress,
    /// Up to four topic positions; `None` is a wildcard, `Some` is any-of.
    #[serde(default)]
    pub topics: Vec<Option<Vec<String>>>,
    /// Start block (inclusive), `None` = genesis.
    #[serde(default)]
    pub from_block: Option<u64>,
    /// End block (inclusive), `None` = follow the tip forever.
    #[serde(default)]
    pub to_block: Option<u64>,
    /// Also fetch and store receipts for matched transactions.
    #[serde(default)]
    pub include_transaction_receipts: bool,
    /// Also fetch and store call traces of matched transactions.
    #[serde(default)]
    pub include_call_traces: bool,
}

impl LogFilter {
    /// Filter for logs emitted by a single contract.
    pub fn address(chain_id: u64, address: impl Into<String>) -> Self {
        Self {
            chain_id,
            address: LogAddress::Static(vec![address.into()]),
            topics: Vec::new(),
            from_block: None,
            to_block: None,
            include_transaction_receipts: false,
            include_call_traces: false,
        }
    }

    /// Filter for logs emitted by children of `factory`.
    pub fn factory(chain_id: u64, factory: Factory) -> Self {
        Self {
            address: LogAddress::Factory(factory),
            ..Self::address(chain_id, "")
        }
    }

    /// Restrict topic0 to `topic` (adds to the any-of list).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        if self.topics.is_empty() {
            self.topics.push(None);
        }
        self.topics[0]
            .get_or_insert_with(Vec::new)
            .push(topic.into());
        self
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = Some(block);
        self
    }

    pub fn to_block(mut self, block: u64) -> Self {
        self.to_block = Some(block);
        self
    }

    pub fn with_receipts(mut self) -> Self {
        self.include_transaction_receipts = true;
        self
    }

    pub fn with_traces(mut self) -> Self {
        self.include_call_traces = true;
        self
    }

    pub fn factory_ref(&self) -> Option<&Factory> {
        match &self.address {
            LogAddress::Factory(factory) => Some(factory),
            LogAddress::Any | LogAddress::Static(_) => None,
        }
    }

    /// The filter's block range as a closed interval.
    pub fn block_range(&self) -> Interval {
        (self.from_block.unwrap_or(0), self.to_block.unwrap_or(u64::MAX))
    }

    pub fn contains_block(&self, number: u64) -> bool {
        let (from, to) = self.block_range();
        from <= number && number <= to
    }

    /// Returns `true` if every configured topic position matches.
    pub fn matches_topics(&self, log: &Log) -> bool {
        self.topics.iter().enumerate().all(|(i, allowed)| match allowed {
            None => true,
            Some(values) => log
                .topics
                .get(i)
                .is_some_and(|t| values.iter().any(|v| v.eq_ignore_ascii_case(t))),
        })
    }

    /// Match ignoring factory membership: a factory filter accepts any emitter.
    ///
    /// Used to narrow fetched logs before child addresses are known.
    pub fn matches_candidate(&self, log: &Log) -> bool {
        if !self.contains_block(log.block_number) || !self.matches_topics(log) {
            return false;
        }
        match &self.address {
            LogAddress::Any | LogAddress::Factory(_) => true,
            LogAddress::Static(addresses) => addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&log.address)),
        }
    }

    /// Full match. `is_child` answers whether an address is a known child of
    /// this filter's factory; it is only consulted for factory filters.
    pub fn matches<F>(&self, log: &Log, is_child: F) -> bool
    where
        F: Fn(&Factory, &str) -> bool,
    {
        if !self.matches_candidate(log) {
            return false;
        }
        match &self.address {
            LogAddress::Factory(factory) => is_child(factory, &log.address.to_ascii_lowercase()),
            LogAddress::Any | LogAddress::Static(_) => true,
        }
    }

    /// Split the filter into its interval-tracking fragments.
    pub fn fragments(&self) -> Vec<Fragment> {
        let addresses: Vec<String> = match &self.address {
            LogAddress::Any => vec!["*".to_string()],
            LogAddress::Static(list) if list.is_empty() => vec!["*".to_string()],
            LogAddress::Static(list) => {
                let mut list: Vec<_> = list.iter().map(|a| a.to_ascii_lowercase()).collect();
                list.sort();
                list.dedup();
                list
            }
            LogAddress::Factory(factory) => vec![factory.id()],
        };

        let topic_key = |values: Option<&Option<Vec<String>>>| -> Vec<String> {
            match values {
                Some(Some(values)) if !values.is_empty() => {
                    let mut values: Vec<_> =
                        values.iter().map(|v| v.to_ascii_lowercase()).collect();
                    values.sort();
                    values.dedup();
                    values
                }
                _ => vec!["*".to_string()],
            }
        };

        let topic0s = topic_key(self.topics.first());
        let rest = (1..4)
            .map(|i| topic_key(self.topics.get(i)).join("|"))
            .collect::<Vec<_>>()
            .join("_");

        let mut fragments = Vec::with_capacity(addresses.len() * topic0s.len());
        for address in &addresses {
            for topic0 in &topic0s {
                fragments.push(Fragment {
                    id: format!("{}_{address}_{topic0}_{rest}", self.chain_id),
                });
            }
        }
        fragments
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// A named filter. Events carry the source name as `source_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub filter: LogFilter,
}

impl Source {
    pub fn new(name: impl Into<String>, filter: LogFilter) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.filter.chain_id
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
