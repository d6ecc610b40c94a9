use std::collections::{BTreeMap, HashMap};

/// Per-AP mean RSSI over the scans the AP appears in, rounded half up.
pub fn average_scans(scans: &[HashMap<String, i32>]) -> HashMap<String, i32> {
    average_readings(scans.iter().flatten().map(|(ap, &rssi)| (ap.as_str(), rssi)))
}

/// Per-AP mean over every `(ap, rssi)` reading, rounded half up.
/// An AP may appear any number of times, including within one scan.
pub fn average_readings<'a>(readings: impl IntoIterator<Item = (&'a str, i32)>) -> HashMap<String, i32> {
    let mut sums: HashMap<&str, (i64, i64)> = HashMap::new();
    for (ap, rssi) in readings {
        let entry = sums.entry(ap).or_insert((0, 0));
        entry.0 += i64::from(rssi);
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(ap, (sum, n))| {
            let mean = sum as f64 / n as f64;
            (ap.to_string(), (mean + 0.5).floor() as i32)
        })
        .collect()
}

/// Highest-probability cell; ties go to whichever comes first in `cells`.
pub fn best_cell(posterior: &BTreeMap<String, f64>, cells: &[String]) -> Option<(String, f64)> {
    let mut best: Option<(&String, f64)> = None;
    for cell in cells {
        let Some(&p) = posterior.get(cell) else { continue };
        if best.map_or(true, |(_, top)| p > top) {
            best = Some((cell, p));
        }
    }
    // cells the caller did not list still count, after the listed ones
    for (cell, &p) in posterior {
        if cells.contains(cell) {
            continue;
        }
        if best.map_or(true, |(_, top)| p > top) {
            best = Some((cell, p));
        }
    }
    best.map(|(cell, p)| (cell.clone(), p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(readings: &[(&str, i32)]) -> HashMap<String, i32> {
        readings.iter().map(|&(ap, r)| (ap.to_string(), r)).collect()
    }

    fn cells(names: &[&str]) -> Vec<String> {
        names.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn averages_each_ap_over_scans_it_appears_in() {
        let out = average_scans(&[scan(&[("a", -50), ("b", -70)]), scan(&[("a", -60)]), scan(&[("a", -55)])]);
        assert_eq!(out["a"], -55);
        assert_eq!(out["b"], -70);
        assert_eq!(out.len(), 2);
    }

    #[test] fn half_rounds_toward_positive_infinity() { assert_eq!(average_scans(&[scan(&[("a", -52)]), scan(&[("a", -53)])])["a"], -52); }
    #[test] fn below_half_rounds_down() { assert_eq!(average_scans(&[scan(&[("a", -50)]), scan(&[("a", -50)]), scan(&[("a", -51)])])["a"], -50); }
    #[test] fn no_scans_gives_nothing() { assert!(average_scans(&[]).is_empty()); }

    #[test]
    fn repeated_readings_of_one_ap_all_count() {
        let out = average_readings([("a", -50), ("a", -60), ("b", -71), ("a", -55)]);
        assert_eq!(out["a"], -55);
        assert_eq!(out["b"], -71);
    }

    #[test]
    fn best_cell_picks_argmax() {
        let posterior: BTreeMap<String, f64> = [("C1".to_string(), 0.2), ("C2".to_string(), 0.8)].into_iter().collect();
        assert_eq!(best_cell(&posterior, &cells(&["C1", "C2"])), Some(("C2".to_string(), 0.8)));
    }

    #[test]
    fn best_cell_tie_goes_to_cell_order() {
        let posterior: BTreeMap<String, f64> = [("C1".to_string(), 0.5), ("C2".to_string(), 0.5)].into_iter().collect();
        assert_eq!(best_cell(&posterior, &cells(&["C2", "C1"])).unwrap().0, "C2");
    }

    #[test]
    fn best_cell_of_empty_is_none() {
        assert!(best_cell(&BTreeMap::new(), &cells(&["C1"])).is_none());
    }
}
