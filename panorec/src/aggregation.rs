//! # Track aggregation
//!
//! Binds features of a new viewpoint to structures reachable through the match table, creating
//! new structures when matches exist but none of the matched features is bound yet.

use crate::entity::Model;
use crate::prelude::v1::*;
use log::*;

/// Outcome counters of a single aggregation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregationReport {
    /// Features with no matches at all.
    pub unmatched: usize,
    /// Features whose best structure did not qualify.
    pub skipped: usize,
    /// Structures created.
    pub created: usize,
    /// Existing structures extended.
    pub extended: usize,
}

/// Decision taken for a single feature of the new viewpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decision {
    Unmatched,
    Create,
    Extend(usize),
    Skip,
}

/// Pick the structure with the strictly highest occurrence.
///
/// Exact ties are won by the structure seen first.
fn best_structure(reached: &[(usize, usize)]) -> Option<(usize, usize)> {
    let (first, rest) = reached.split_first()?;

    Some(rest.iter().fold(*first, |best, &candidate| {
        if candidate.1 > best.1 {
            candidate
        } else {
            best
        }
    }))
}

/// Decide what to do with feature `q` of the new viewpoint.
fn decide(model: &Model, base: usize, table: &MatchTable, q: usize) -> Result<Decision> {
    // Distinct structures in first-seen order, with occurrence counts.
    let mut reached: Vec<(usize, usize)> = vec![];
    let mut matched = 0;

    for (slot, f) in table.matches(q) {
        let feature = model.viewpoints[base + slot]
            .features
            .get(f)
            .ok_or_else(|| {
                anyhow!(
                    "match of feature {} points to missing feature {} of viewpoint {}",
                    q,
                    f,
                    base + slot
                )
            })?;

        matched += 1;

        if let Some(s) = feature.structure {
            match reached.iter_mut().find(|(rs, _)| *rs == s) {
                Some((_, cnt)) => *cnt += 1,
                None => reached.push((s, 1)),
            }
        }
    }

    Ok(match (matched, best_structure(&reached)) {
        (0, _) => Decision::Unmatched,
        (_, None) => Decision::Create,
        (_, Some((s, occurrence))) if occurrence >= 1 => Decision::Extend(s),
        _ => Decision::Skip,
    })
}

/// Aggregate features of a new viewpoint into structures.
///
/// The match table covers the `table.slots()` viewpoints right before `new_viewpoint`.
///
/// # Arguments
///
/// * `model` - model to update. `new_viewpoint` must already be part of it.
/// * `new_viewpoint` - index of the viewpoint to aggregate.
/// * `table` - matches of the new viewpoint's features against local viewpoints.
pub fn aggregate(
    model: &mut Model,
    new_viewpoint: usize,
    table: &MatchTable,
) -> Result<AggregationReport> {
    let features = model
        .viewpoints
        .get(new_viewpoint)
        .ok_or_else(|| anyhow!("viewpoint {} does not exist", new_viewpoint))?
        .features
        .len();

    if table.features() != features {
        bail!(
            "match table covers {} features, viewpoint {} has {}",
            table.features(),
            new_viewpoint,
            features
        );
    }

    let base = new_viewpoint
        .checked_sub(table.slots())
        .ok_or_else(|| anyhow!("match table spans {} slots before viewpoint {}", table.slots(), new_viewpoint))?;

    let mut report = AggregationReport::default();

    for q in 0..features {
        let target = match decide(model, base, table, q)? {
            Decision::Unmatched => {
                report.unmatched += 1;
                continue;
            }
            Decision::Skip => {
                report.skipped += 1;
                continue;
            }
            Decision::Create => {
                report.created += 1;
                model.push_structure()
            }
            Decision::Extend(s) => {
                report.extended += 1;
                s
            }
        };

        // A structure takes at most one feature per viewpoint.
        for (slot, f) in table.matches(q) {
            let vp = base + slot;

            if model.viewpoints[vp].features[f].structure.is_none()
                && !model.structures[target].observes(vp)
            {
                model.bind(target, vp, f)?;
            }
        }

        if model.structures[target].observes(new_viewpoint) {
            debug!(
                "structure {} already observes viewpoint {}, feature {} left unbound",
                target, new_viewpoint, q
            );
        } else {
            model.bind(target, new_viewpoint, q)?;
        }
    }

    Ok(report)
}
