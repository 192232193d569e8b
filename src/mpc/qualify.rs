//! Qualified-set computation
//!
//! Every responder reports which partners it still considers qualified.
//! Only mutual "heard from" edges count. Nodes are then pruned, fewest
//! mutual edges first, until the survivors form a complete graph. Among
//! equally connected nodes the one left off the most surviving reports goes
//! first, so a partner rejected for bad data is pruned instead of the
//! partner that rejected it. Remaining ties go against the higher id so
//! every honest node prunes identically.

use crate::error::RejectionGraph;
use crate::types::PartnerId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualification {
    /// Surviving partners, sorted
    pub qualified: Vec<PartnerId>,
    pub graph: RejectionGraph,
}

/// Compute the next qualified set from `reports` (responder -> its qualified list)
pub fn qualified_partners(
    candidates: &[PartnerId],
    reports: &BTreeMap<PartnerId, Vec<PartnerId>>,
) -> Qualification {
    let vertices: BTreeSet<PartnerId> = candidates.iter().copied().collect();
    let heard: BTreeMap<PartnerId, BTreeSet<PartnerId>> = reports
        .iter()
        .filter(|(id, _)| vertices.contains(id))
        .map(|(id, list)| {
            let set = list
                .iter()
                .copied()
                .filter(|p| p != id && vertices.contains(p))
                .collect();
            (*id, set)
        })
        .collect();

    let mut edges: BTreeMap<PartnerId, BTreeSet<PartnerId>> = BTreeMap::new();
    for &a in &vertices {
        let mutual = heard
            .get(&a)
            .map(|list| {
                list.iter()
                    .copied()
                    .filter(|b| heard.get(b).map(|l| l.contains(&a)).unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        edges.insert(a, mutual);
    }

    let mut remaining = vertices.clone();
    let mut removed = Vec::new();
    loop {
        let target = remaining.len().saturating_sub(1);
        let degrees: Vec<(usize, usize, PartnerId)> = remaining
            .iter()
            .map(|id| {
                let degree = edges[id].iter().filter(|b| remaining.contains(b)).count();
                let accusers = remaining
                    .iter()
                    .filter(|r| {
                        *r != id && heard.get(*r).map(|list| !list.contains(id)).unwrap_or(false)
                    })
                    .count();
                (degree, accusers, *id)
            })
            .collect();
        if degrees.iter().all(|(degree, _, _)| *degree == target) {
            break;
        }
        // fewest edges; ties go to the most accused, then the higher id
        let Some(&(_, _, victim)) = degrees.iter().min_by(|(da, aa, ia), (db, ab, ib)| {
            da.cmp(db).then(ab.cmp(aa)).then(ib.cmp(ia))
        }) else {
            break;
        };
        remaining.remove(&victim);
        removed.push(victim);
    }

    Qualification {
        qualified: remaining.into_iter().collect(),
        graph: RejectionGraph {
            edges: edges
                .into_iter()
                .map(|(id, set)| (id, set.into_iter().collect()))
                .collect(),
            removed,
            unreachable: vertices
                .iter()
                .copied()
                .filter(|id| !reports.contains_key(id))
                .collect(),
        },
    }
}
