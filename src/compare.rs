//! Agreement between the barometric and GPS altitude classifications.
//!
//! The two fits are compared at the behavior-label level, fix by fix, after
//! both decodes. Counts go into a square confusion matrix (rows = baro,
//! columns = gps) from which overall agreement, Cohen's kappa, and per-label
//! precision/recall/F1 are derived.

use std::fmt::Write as _;

use itertools::Itertools;

#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    labels: Vec<String>,
    /// row-major counts, rows = reference (baro), cols = gps
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    /// Build from paired per-fix labels. Label order follows first
    /// appearance across either sequence.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut labels: Vec<String> = vec![];
        let mut raw: Vec<(usize, usize)> = vec![];
        let index_of = |labels: &mut Vec<String>, l: &str| -> usize {
            match labels.iter().position(|x| x == l) {
                Some(i) => i,
                None => {
                    labels.push(l.to_owned());
                    labels.len() - 1
                }
            }
        };
        for (a, b) in pairs {
            let ia = index_of(&mut labels, a);
            let ib = index_of(&mut labels, b);
            raw.push((ia, ib));
        }
        let n = labels.len();
        let mut counts = vec![0u64; n * n];
        for (ia, ib) in raw {
            counts[ia * n + ib] += 1;
        }
        Self { labels, counts }
    }

    pub fn n_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn count(&self, row: usize, col: usize) -> u64 {
        self.counts[row * self.n_labels() + col]
    }

    fn row_sum(&self, row: usize) -> u64 {
        (0..self.n_labels()).map(|j| self.count(row, j)).sum()
    }

    fn col_sum(&self, col: usize) -> u64 {
        (0..self.n_labels()).map(|i| self.count(i, col)).sum()
    }

    /// Fraction of fixes on which both classifications agree.
    pub fn agreement(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return f64::NAN;
        }
        let diag: u64 = (0..self.n_labels()).map(|i| self.count(i, i)).sum();
        diag as f64 / total as f64
    }

    /// Cohen's kappa: agreement corrected for chance.
    pub fn kappa(&self) -> f64 {
        let total = self.total() as f64;
        if total == 0.0 {
            return f64::NAN;
        }
        let po = self.agreement();
        let pe: f64 = (0..self.n_labels())
            .map(|i| (self.row_sum(i) as f64 / total) * (self.col_sum(i) as f64 / total))
            .sum();
        if (1.0 - pe).abs() < 1e-12 {
            return f64::NAN;
        }
        (po - pe) / (1.0 - pe)
    }

    /// (precision, recall, f1) for one label, treating the baro rows as the
    /// reference classification.
    pub fn precision_recall_f1(&self, i: usize) -> (f64, f64, f64) {
        let tp = self.count(i, i) as f64;
        let col = self.col_sum(i) as f64;
        let row = self.row_sum(i) as f64;
        let precision = if col > 0.0 { tp / col } else { f64::NAN };
        let recall = if row > 0.0 { tp / row } else { f64::NAN };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            f64::NAN
        };
        (precision, recall, f1)
    }

    /// TSV rendering: the count matrix, then one summary row per label, then
    /// the overall statistics.
    pub fn render_tsv(&self) -> String {
        let n = self.n_labels();
        let mut s = String::new();
        let _ = writeln!(s, "baro\\gps\t{}", self.labels.iter().join("\t"));
        for i in 0..n {
            let row = (0..n).map(|j| self.count(i, j)).join("\t");
            let _ = writeln!(s, "{}\t{}", self.labels[i], row);
        }
        let _ = writeln!(s);
        let _ = writeln!(s, "label\tprecision\trecall\tf1");
        for i in 0..n {
            let (p, r, f1) = self.precision_recall_f1(i);
            let _ = writeln!(s, "{}\t{:.4}\t{:.4}\t{:.4}", self.labels[i], p, r, f1);
        }
        let _ = writeln!(s);
        let _ = writeln!(s, "n_fixes\t{}", self.total());
        let _ = writeln!(s, "agreement\t{:.4}", self.agreement());
        let _ = writeln!(s, "cohens_kappa\t{:.4}", self.kappa());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_from(counts: &[(&str, &str, usize)]) -> ConfusionMatrix {
        let mut pairs = vec![];
        for &(a, b, n) in counts {
            for _ in 0..n {
                pairs.push((a, b));
            }
        }
        ConfusionMatrix::from_pairs(pairs)
    }

    #[test]
    fn perfect_agreement() {
        let m = matrix_from(&[("rest", "rest", 10), ("flap", "flap", 5), ("soar", "soar", 5)]);
        assert_eq!(m.total(), 20);
        assert_eq!(m.agreement(), 1.0);
        assert!((m.kappa() - 1.0).abs() < 1e-12);
        for i in 0..3 {
            let (p, r, f1) = m.precision_recall_f1(i);
            assert_eq!((p, r, f1), (1.0, 1.0, 1.0));
        }
    }

    #[test]
    fn kappa_on_known_table() {
        // classic 2x2 example: po = 0.7, pe = 0.5 -> kappa = 0.4
        let m = matrix_from(&[
            ("a", "a", 35),
            ("a", "b", 15),
            ("b", "a", 15),
            ("b", "b", 35),
        ]);
        assert!((m.agreement() - 0.7).abs() < 1e-12);
        assert!((m.kappa() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn chance_level_kappa_is_zero() {
        // independent classifications: every cell 25 of 100
        let m = matrix_from(&[
            ("a", "a", 25),
            ("a", "b", 25),
            ("b", "a", 25),
            ("b", "b", 25),
        ]);
        assert!((m.agreement() - 0.5).abs() < 1e-12);
        assert!(m.kappa().abs() < 1e-12);
    }

    #[test]
    fn precision_recall_asymmetry() {
        let m = matrix_from(&[("rest", "rest", 8), ("rest", "flap", 2), ("flap", "flap", 10)]);
        let (p, r, _) = m.precision_recall_f1(0); // rest
        assert_eq!(p, 1.0); // nothing else predicted rest
        assert!((r - 0.8).abs() < 1e-12);
    }

    #[test]
    fn render_contains_matrix_and_summary() {
        let m = matrix_from(&[("rest", "rest", 3), ("flap", "soar", 1)]);
        let tsv = m.render_tsv();
        assert!(tsv.contains("baro\\gps"));
        assert!(tsv.contains("cohens_kappa"));
        assert!(tsv.contains("agreement"));
        assert!(tsv.lines().count() > 6);
    }

    #[test]
    fn empty_input_yields_nan_stats() {
        let m = ConfusionMatrix::from_pairs(std::iter::empty::<(&str, &str)>());
        assert_eq!(m.total(), 0);
        assert!(m.agreement().is_nan());
        assert!(m.kappa().is_nan());
    }
}
