//! # Routing Table
//!
//! A deterministic, per-rank destination list derived from a sparse routing
//! table plus a default policy. Used by both gap engines and the channel
//! runner to decide where each rank's packets go.
//!
//! The route is a pure function of configuration: the same `Router`
//! instance returns the same list on every call to [`Router::route`].

use std::collections::{HashMap, HashSet};

use crate::error::ConfigError;

pub type Rank = u64;

/// What a sender does when it has no explicit entry in the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultRouting {
    /// Send to every other rank, in ring order starting at `(self + 1) % N`.
    ToAll,
    /// Send to nobody.
    ToNone,
}

/// Sender-indexed list of destinations. Insertion order within a sender's
/// list is preserved (a `Vec`, not a set) since ties are broken by
/// insertion order per spec.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: HashMap<Rank, Vec<Rank>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sender: Rank, destinations: Vec<Rank>) {
        self.entries.insert(sender, destinations);
    }

    pub fn get(&self, sender: Rank) -> Option<&[Rank]> {
        self.entries.get(&sender).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the line-oriented `sender ':' dest (',' dest)*` format from
    /// spec.md §6. Unlike the original loader, a malformed line is treated
    /// as a hard error rather than silently dropped (see SPEC_FULL.md §4.1
    /// / Open Question resolution in DESIGN.md): a routing table that
    /// silently lost an entry would still report `is_complete() == true`
    /// for the wrong reason, only to hang downstream when a peer never
    /// receives the count of packets the gap engine expects from it.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut table = RoutingTable::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let err = || ConfigError::InvalidRoutingTable {
                line_no: idx + 1,
                line: raw_line.to_string(),
            };

            let (sender_str, rest) = line.split_once(':').ok_or_else(err)?;
            let sender: Rank = sender_str.trim().parse().map_err(|_| err())?;

            let rest = rest.trim();
            let destinations = if rest.is_empty() {
                Vec::new()
            } else {
                rest.split(',')
                    .map(|tok| tok.trim().parse::<Rank>().map_err(|_| err()))
                    .collect::<Result<Vec<_>, _>>()?
            };

            table.insert(sender, destinations);
        }
        Ok(table)
    }
}

/// Deterministic per-rank destination router.
///
/// `Router::route()` is a pure function of the configuration it was built
/// with (see SPEC_FULL.md §9 Open Question: the API shape allows per-call
/// variation, but this implementation intentionally only supports the
/// constant-per-call behavior the original exhibits).
#[derive(Debug, Clone)]
pub struct Router {
    world_size: u64,
    rank: Rank,
    table: RoutingTable,
    default_routing: DefaultRouting,
}

impl Router {
    pub fn new(
        world_size: u64,
        rank: Rank,
        table: RoutingTable,
        default_routing: DefaultRouting,
    ) -> Self {
        Self {
            world_size,
            rank,
            table,
            default_routing,
        }
    }

    /// Returns this rank's ordered list of destinations. Destinations
    /// `>= world_size` are silently dropped (spec.md §3); ties within a
    /// table entry are insertion order, ring order for the `to_all`
    /// default.
    pub fn route(&self) -> Vec<Rank> {
        match self.table.get(self.rank) {
            Some(destinations) => destinations
                .iter()
                .copied()
                .filter(|&r| r < self.world_size)
                .collect(),
            None => match self.default_routing {
                DefaultRouting::ToAll => {
                    if self.world_size == 0 {
                        return Vec::new();
                    }
                    let mut result = Vec::with_capacity((self.world_size - 1) as usize);
                    let mut dest = (self.rank + 1) % self.world_size;
                    while dest != self.rank {
                        result.push(dest);
                        dest = (dest + 1) % self.world_size;
                    }
                    result
                }
                DefaultRouting::ToNone => Vec::new(),
            },
        }
    }

    /// True iff every sender's route, union its own rank, covers
    /// `{0, .., world_size - 1}` — i.e. the table is a complete all-to-all
    /// description once defaults are applied.
    pub fn is_complete(&self) -> bool {
        for sender in 0..self.world_size {
            let route = match self.table.get(sender) {
                Some(destinations) => destinations
                    .iter()
                    .copied()
                    .filter(|&r| r < self.world_size)
                    .collect::<Vec<_>>(),
                None => match self.default_routing {
                    DefaultRouting::ToAll => {
                        let mut result = Vec::new();
                        let mut dest = (sender + 1) % self.world_size;
                        while dest != sender {
                            result.push(dest);
                            dest = (dest + 1) % self.world_size;
                        }
                        result
                    }
                    DefaultRouting::ToNone => Vec::new(),
                },
            };
            let mut covered: HashSet<Rank> = route.into_iter().collect();
            covered.insert(sender);
            if (covered.len() as u64) < self.world_size {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_all_default_excludes_self_in_ring_order() {
        let router = Router::new(4, 1, RoutingTable::new(), DefaultRouting::ToAll);
        assert_eq!(router.route(), vec![2, 3, 0]);
    }

    #[test]
    fn to_none_default_is_empty() {
        let router = Router::new(4, 1, RoutingTable::new(), DefaultRouting::ToNone);
        assert!(router.route().is_empty());
    }

    #[test]
    fn explicit_entry_overrides_default_and_drops_out_of_range() {
        let mut table = RoutingTable::new();
        table.insert(0, vec![1, 2, 3, 99]);
        let router = Router::new(4, 0, table, DefaultRouting::ToAll);
        assert_eq!(router.route(), vec![1, 2, 3]);
    }

    #[test]
    fn complete_table_round_trips_to_full_world() {
        let mut table = RoutingTable::new();
        table.insert(0, vec![1, 2, 3]);
        table.insert(1, vec![0, 2, 3]);
        table.insert(2, vec![0, 1, 3]);
        table.insert(3, vec![0, 1, 2]);
        for rank in 0..4 {
            let router = Router::new(4, rank, table.clone(), DefaultRouting::ToNone);
            assert!(router.is_complete());
        }
    }

    #[test]
    fn missing_sender_with_to_none_default_is_incomplete() {
        let mut table = RoutingTable::new();
        table.insert(0, vec![1, 2, 3]);
        table.insert(2, vec![0, 1, 3]);
        table.insert(3, vec![0, 1, 2]);
        // rank 1 is absent, default is to_none => incomplete
        let router = Router::new(4, 0, table, DefaultRouting::ToNone);
        assert!(!router.is_complete());
    }

    #[test]
    fn parse_accepts_blank_destination_list() {
        let table = RoutingTable::parse("0: 1, 2\n1:\n2: 0, 1\n").unwrap();
        assert_eq!(table.get(0), Some(&[1, 2][..]));
        assert_eq!(table.get(1), Some(&[][..]));
        assert_eq!(table.get(2), Some(&[0, 1][..]));
    }

    #[test]
    fn parse_rejects_malformed_line() {
        let err = RoutingTable::parse("0: 1, 2\nnot-a-line\n").unwrap_err();
        match err {
            ConfigError::InvalidRoutingTable { line_no, .. } => assert_eq!(line_no, 2),
            other => panic!("expected InvalidRoutingTable, got {other:?}"),
        }
    }

    #[test]
    fn route_is_pure_and_constant_per_call() {
        let router = Router::new(4, 1, RoutingTable::new(), DefaultRouting::ToAll);
        assert_eq!(router.route(), router.route());
    }

    #[test]
    fn single_rank_world_is_trivially_complete() {
        let router = Router::new(1, 0, RoutingTable::new(), DefaultRouting::ToNone);
        assert!(router.is_complete());
    }
}
