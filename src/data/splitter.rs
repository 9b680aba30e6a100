// ============================================================
// Layer 4 — Fold Splitter
// ============================================================
// Partitions the file index set 0..n into train/dev subsets.
//
// K-fold (k >= 2):
//   1. Optionally shuffle the indices with a seeded StdRng
//   2. Cut them into k contiguous dev blocks; the first n % k
//      blocks get one extra index
//   3. Fold i trains on everything outside dev block i
//
//   n = 10, k = 3  →  dev sizes 4, 3, 3
//
//   Every index appears in exactly one dev block, so the k dev
//   sets are disjoint and together cover 0..n exactly once.
//
// Holdout (k < 2):
//   One seeded shuffle, first `train_fraction` of the indices
//   train, the rest validate. Reported as fold 1.
//
// Fisher-Yates shuffle via rand::seq::SliceRandom, seeded so the
// same config always produces the same folds. A resumed run relies
// on this to load the right checkpoint for the right split.
//
// Reference: rand crate documentation (SliceRandom, StdRng)

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::domain::fold::FoldSplit;

/// Split `0..n` into `k` folds.
///
/// # Panics
/// When `k < 2` or `k > n`: a fold would have an empty dev set.
pub fn kfold_splits(n: usize, k: usize, shuffle: bool, seed: u64) -> Vec<FoldSplit> {
    assert!(k >= 2, "k-fold needs at least 2 folds, got {k}");
    assert!(k <= n, "cannot make {k} folds from {n} volumes");

    let mut indices: Vec<usize> = (0..n).collect();
    if shuffle {
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    let base  = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;

    for fold in 0..k {
        let size = base + usize::from(fold < extra);
        let dev: Vec<usize> = indices[start..start + size].to_vec();
        let train: Vec<usize> = indices[..start]
            .iter()
            .chain(indices[start + size..].iter())
            .copied()
            .collect();
        folds.push(FoldSplit { fold: fold + 1, train, dev });
        start += size;
    }

    tracing::debug!(
        "k-fold split: {} volumes into {} folds (dev sizes {:?})",
        n,
        k,
        folds.iter().map(|f| f.dev.len()).collect::<Vec<_>>()
    );
    folds
}

/// `0..n`, optionally seeded-shuffled, split into (train, validation).
///
/// # Arguments
/// * `train_fraction` - Proportion for training, e.g. 0.8 = 80%
pub fn holdout_split(n: usize, train_fraction: f64, shuffle: bool, seed: u64) -> FoldSplit {
    let mut indices: Vec<usize> = (0..n).collect();
    if shuffle {
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    // Clamp to valid range to avoid panics on tiny datasets
    let split_at = ((n as f64) * train_fraction).round() as usize;
    let split_at = split_at.min(n);

    // split_off(n) removes elements [n..] from the Vec and returns them
    let dev = indices.split_off(split_at);

    tracing::debug!(
        "holdout split: {} training, {} validation ({}% / {}%)",
        indices.len(),
        dev.len(),
        (indices.len() * 100) / n.max(1),
        (dev.len()     * 100) / n.max(1),
    );

    FoldSplit { fold: 1, train: indices, dev }
}

/// Pick k-fold or holdout depending on `k`.
pub fn make_splits(n: usize, k: usize, shuffle: bool, train_fraction: f64, seed: u64) -> Vec<FoldSplit> {
    if k >= 2 {
        kfold_splits(n, k, shuffle, seed)
    } else {
        vec![holdout_split(n, train_fraction, shuffle, seed)]
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_exact_cover(folds: &[FoldSplit], n: usize) {
        let mut seen = vec![0usize; n];
        for f in folds {
            for &i in &f.dev {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "dev sets must cover 0..{n} exactly once");
    }

    #[test]
    fn test_dev_sets_partition_indices() {
        for n in 2..30 {
            for k in 2..=n.min(10) {
                for shuffle in [false, true] {
                    let folds = kfold_splits(n, k, shuffle, 42);
                    assert_eq!(folds.len(), k);
                    assert_exact_cover(&folds, n);
                }
            }
        }
    }

    #[test]
    fn test_train_is_complement_of_dev() {
        let folds = kfold_splits(11, 4, true, 3);
        for f in &folds {
            let dev: HashSet<usize> = f.dev.iter().copied().collect();
            let train: HashSet<usize> = f.train.iter().copied().collect();
            assert!(dev.is_disjoint(&train));
            assert_eq!(dev.len() + train.len(), 11);
        }
    }

    #[test]
    fn test_first_folds_take_the_remainder() {
        let sizes: Vec<usize> = kfold_splits(10, 3, false, 0).iter().map(|f| f.dev.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn test_unshuffled_folds_are_contiguous() {
        let folds = kfold_splits(6, 3, false, 0);
        assert_eq!(folds[0].dev, vec![0, 1]);
        assert_eq!(folds[1].dev, vec![2, 3]);
        assert_eq!(folds[2].dev, vec![4, 5]);
        assert_eq!(folds[1].train, vec![0, 1, 4, 5]);
        assert_eq!(folds.iter().map(|f| f.fold).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_same_seed_same_folds() {
        assert_eq!(kfold_splits(20, 5, true, 9), kfold_splits(20, 5, true, 9));
    }

    #[test]
    fn test_holdout_sizes() {
        let split = holdout_split(100, 0.8, true, 1);
        assert_eq!(split.train.len(), 80);
        assert_eq!(split.dev.len(), 20);
        assert_eq!(split.fold, 1);
    }

    #[test]
    fn test_unshuffled_holdout_keeps_file_order() {
        let split = holdout_split(5, 0.6, false, 1);
        assert_eq!(split.train, vec![0, 1, 2]);
        assert_eq!(split.dev, vec![3, 4]);

        let splits = make_splits(5, 1, false, 0.6, 1);
        assert_eq!(splits[0], split);
    }

    #[test]
    fn test_make_splits_falls_back_to_holdout() {
        let splits = make_splits(10, 1, true, 0.7, 5);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].train.len() + splits[0].dev.len(), 10);
    }
}
