use std::collections::{BTreeMap, BTreeSet};

use crate::models::{OcrFieldInput, RegionGeometry, RegionId};

/// Id derived from geometry snapped to a `grid` pixel lattice.
pub fn quantized_id(geometry: &RegionGeometry, grid: u32) -> RegionId {
    let grid = grid.max(1);
    RegionId(format!(
        "r{}_{}_{}x{}",
        geometry.x / grid,
        geometry.y / grid,
        geometry.width.div_ceil(grid),
        geometry.height.div_ceil(grid),
    ))
}

/// Assigns region ids to one frame's OCR fields.
///
/// Fields are visited in reading order. A field reuses the id of the known
/// region it overlaps most (IoU at least `match_iou`, each known region
/// claimed at most once per frame); otherwise it gets a quantized id, with a
/// `#n` suffix when that id is already taken in this frame. The result does
/// not depend on the input order of `fields`.
pub fn assign_region_ids<'a>(
    fields: &'a [OcrFieldInput],
    known: &BTreeMap<RegionId, RegionGeometry>,
    grid: u32,
    match_iou: f64,
) -> Vec<(RegionId, &'a OcrFieldInput)> {
    let mut ordered: Vec<&OcrFieldInput> = fields.iter().collect();
    ordered.sort_by(|a, b| {
        (a.geometry.y, a.geometry.x, a.geometry.width, a.geometry.height)
            .cmp(&(b.geometry.y, b.geometry.x, b.geometry.width, b.geometry.height))
            .then_with(|| a.text.cmp(&b.text))
            .then_with(|| a.confidence.total_cmp(&b.confidence))
    });

    let mut taken: BTreeSet<RegionId> = BTreeSet::new();
    let mut assigned = Vec::with_capacity(ordered.len());

    for field in ordered {
        let reused = known
            .iter()
            .filter(|(id, _)| !taken.contains(*id))
            .map(|(id, geometry)| (id, geometry.iou(&field.geometry)))
            .filter(|(_, iou)| *iou >= match_iou)
            .fold(None::<(&RegionId, f64)>, |best, candidate| match best {
                Some((_, best_iou)) if best_iou >= candidate.1 => best,
                _ => Some(candidate),
            })
            .map(|(id, _)| id.clone());

        let id = match reused {
            Some(id) => id,
            None => {
                let base = quantized_id(&field.geometry, grid);
                let mut id = base.clone();
                let mut n = 2;
                while taken.contains(&id) || known.contains_key(&id) {
                    id = RegionId(format!("{}#{n}", base.0));
                    n += 1;
                }
                id
            }
        };

        taken.insert(id.clone());
        assigned.push((id, field));
    }

    assigned
}

/// Jaccard similarity of two id sets; two empty sets are identical.
pub fn set_similarity<'a>(
    before: impl Iterator<Item = &'a RegionId>,
    after: impl Iterator<Item = &'a RegionId>,
) -> f64 {
    let before: BTreeSet<&RegionId> = before.collect();
    let after: BTreeSet<&RegionId> = after.collect();
    let union = before.union(&after).count();
    if union == 0 {
        return 1.0;
    }
    before.intersection(&after).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(x: u32, y: u32, text: &str) -> OcrFieldInput {
        OcrFieldInput {
            geometry: RegionGeometry::new(x, y, 64, 16),
            text: text.into(),
            language: "en".into(),
            confidence: 0.9,
            pii_filtered: false,
        }
    }

    #[test]
    fn jittered_region_reuses_known_id() {
        let mut known = BTreeMap::new();
        known.insert(RegionId("clock".into()), RegionGeometry::new(100, 10, 64, 16));

        let fields = vec![field(102, 11, "12:02")];
        let assigned = assign_region_ids(&fields, &known, 16, 0.5);
        assert_eq!(assigned[0].0, RegionId("clock".into()));
    }

    #[test]
    fn colliding_quantized_ids_get_suffixes() {
        let fields = vec![
            OcrFieldInput {
                geometry: RegionGeometry::new(0, 0, 8, 8),
                ..field(0, 0, "a")
            },
            OcrFieldInput {
                geometry: RegionGeometry::new(1, 1, 8, 8),
                ..field(0, 0, "b")
            },
        ];
        let assigned = assign_region_ids(&fields, &BTreeMap::new(), 16, 0.99);
        let ids: Vec<&str> = assigned.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["r0_0_1x1", "r0_0_1x1#2"]);
    }

    #[test]
    fn assignment_ignores_input_order() {
        let a = vec![field(0, 0, "one"), field(0, 40, "two"), field(200, 0, "three")];
        let mut b = a.clone();
        b.reverse();
        let ids = |fields: &[OcrFieldInput]| {
            assign_region_ids(fields, &BTreeMap::new(), 16, 0.5)
                .into_iter()
                .map(|(id, f)| (id, f.text.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn jaccard_similarity() {
        let a = [RegionId("a".into()), RegionId("b".into())];
        let b = [RegionId("b".into()), RegionId("c".into())];
        assert!((set_similarity(a.iter(), b.iter()) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(set_similarity([].iter(), [].iter()), 1.0);
    }
}
