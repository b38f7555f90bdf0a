//! Binary random forest classifier.
//!
//! Bagged CART trees grown to purity with Gini impurity. At each split a
//! random subset of `floor(sqrt(n_features))` non-constant features is
//! examined. The forest votes by averaging leaf probabilities.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        positive: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

/// Gini impurity of a node, weighted by its sample count.
fn weighted_gini(positive: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = positive as f64 / n as f64;
    n as f64 * 2.0 * p * (1.0 - p)
}

fn best_split(
    x: &[Vec<f64>],
    y: &[bool],
    samples: &[usize],
    max_features: usize,
    rng: &mut StdRng,
) -> Option<(usize, f64)> {
    let n_features = x[samples[0]].len();
    let total = samples.len();
    let total_positive = samples.iter().filter(|&&i| y[i]).count();

    let mut features: Vec<usize> = (0..n_features).collect();
    let mut sorted = samples.to_vec();
    let mut visited = 0;
    let mut best: Option<(f64, usize, f64)> = None;

    for k in 0..n_features {
        if visited >= max_features {
            break;
        }
        let pick = rng.random_range(k..n_features);
        features.swap(k, pick);
        let f = features[k];

        sorted.sort_by(|&a, &b| x[a][f].total_cmp(&x[b][f]));
        if x[sorted[0]][f] == x[sorted[total - 1]][f] {
            continue;
        }
        visited += 1;

        let mut left_positive = 0;
        for w in 0..total - 1 {
            if y[sorted[w]] {
                left_positive += 1;
            }
            let (lo, hi) = (x[sorted[w]][f], x[sorted[w + 1]][f]);
            if lo == hi {
                continue;
            }
            let left = w + 1;
            let impurity = weighted_gini(left_positive, left)
                + weighted_gini(total_positive - left_positive, total - left);
            if best.map_or(true, |(b, _, _)| impurity < b) {
                let mut threshold = lo / 2.0 + hi / 2.0;
                if threshold == hi {
                    threshold = lo;
                }
                best = Some((impurity, f, threshold));
            }
        }
    }
    best.map(|(_, f, t)| (f, t))
}

impl Tree {
    fn fit(
        x: &[Vec<f64>],
        y: &[bool],
        samples: Vec<usize>,
        max_features: usize,
        rng: &mut StdRng,
    ) -> Self {
        let mut nodes = vec![Node::Leaf { positive: 0.0 }];
        let mut pending = vec![(0usize, samples)];

        while let Some((at, samples)) = pending.pop() {
            let positives = samples.iter().filter(|&&i| y[i]).count();
            let positive = positives as f64 / samples.len() as f64;
            let pure = positives == 0 || positives == samples.len();
            let split = if pure || samples.len() < 2 {
                None
            } else {
                best_split(x, y, &samples, max_features, rng)
            };
            let Some((feature, threshold)) = split else {
                nodes[at] = Node::Leaf { positive };
                continue;
            };

            let (l, r): (Vec<usize>, Vec<usize>) =
                samples.into_iter().partition(|&i| x[i][feature] <= threshold);
            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf { positive: 0.0 });
            nodes.push(Node::Leaf { positive: 0.0 });
            nodes[at] = Node::Split {
                feature,
                threshold,
                left,
                right,
            };
            pending.push((left, l));
            pending.push((right, r));
        }
        Self { nodes }
    }

    fn predict_proba(&self, row: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match self.nodes[at] {
                Node::Leaf { positive } => return positive,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if row[feature] <= threshold { left } else { right },
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<Tree>,
    n_features: usize,
}

impl RandomForest {
    /// Train on rows `x` (one feature vector per sample) and labels `y`.
    pub fn fit(x: &[Vec<f64>], y: &[bool], params: ForestParams) -> Result<Self> {
        if x.is_empty() || x.len() != y.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![y.len()],
                found: vec![x.len()],
            });
        }
        let n_features = x[0].len();
        if n_features == 0 || x.iter().any(|r| r.len() != n_features) {
            return Err(Error::Config("feature rows must be non-empty and equally long".into()));
        }
        let max_features = ((n_features as f64).sqrt() as usize).max(1);
        let n = x.len();

        let mut rng = StdRng::seed_from_u64(params.seed);
        let trees = (0..params.n_trees.max(1))
            .map(|_| {
                let mut tree_rng = StdRng::seed_from_u64(rng.random());
                let bootstrap: Vec<usize> =
                    (0..n).map(|_| tree_rng.random_range(0..n)).collect();
                Tree::fit(x, y, bootstrap, max_features, &mut tree_rng)
            })
            .collect();
        Ok(Self { trees, n_features })
    }

    /// Mean positive-class probability over the trees.
    pub fn predict_proba(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.n_features {
            return Err(Error::ShapeMismatch {
                expected: vec![self.n_features],
                found: vec![row.len()],
            });
        }
        let sum: f64 = self.trees.iter().map(|t| t.predict_proba(row)).sum();
        Ok(sum / self.trees.len() as f64)
    }

    /// Majority class; ties go to the negative class.
    pub fn predict(&self, row: &[f64]) -> Result<bool> {
        Ok(self.predict_proba(row)? > 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable() -> (Vec<Vec<f64>>, Vec<bool>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            let noise = (i % 7) as f64;
            let positive = i % 2 == 0;
            let signal = if positive { 100.0 + noise } else { 10.0 + noise };
            x.push(vec![noise * 3.0, signal, 50.0 - noise]);
            y.push(positive);
        }
        (x, y)
    }

    #[test]
    fn learns_a_separable_signal() {
        let (x, y) = separable();
        let forest = RandomForest::fit(&x, &y, ForestParams::default()).unwrap();
        for (row, &label) in x.iter().zip(&y) {
            assert_eq!(forest.predict(row).unwrap(), label);
        }
        assert!(forest.predict(&[0.0, 120.0, 50.0]).unwrap());
        assert!(!forest.predict(&[0.0, 5.0, 50.0]).unwrap());
    }

    #[test]
    fn same_seed_same_model() {
        let (x, y) = separable();
        let params = ForestParams { n_trees: 10, seed: 7 };
        let a = RandomForest::fit(&x, &y, params).unwrap();
        let b = RandomForest::fit(&x, &y, params).unwrap();
        let probe = [9.0, 55.0, 47.0];
        assert_eq!(a.predict_proba(&probe).unwrap(), b.predict_proba(&probe).unwrap());
    }

    #[test]
    fn single_class_predicts_that_class() {
        let x = vec![vec![1.0], vec![2.0], vec![3.0]];
        let forest = RandomForest::fit(&x, &[true, true, true], ForestParams::default()).unwrap();
        assert_eq!(forest.predict_proba(&[10.0]).unwrap(), 1.0);
    }

    #[test]
    fn shape_errors() {
        assert!(RandomForest::fit(&[], &[], ForestParams::default()).is_err());
        let x = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(RandomForest::fit(&x, &[true, false], ForestParams::default()).is_err());
        let forest =
            RandomForest::fit(&[vec![1.0], vec![2.0]], &[true, false], ForestParams::default())
                .unwrap();
        assert!(forest.predict(&[1.0, 2.0]).is_err());
    }
}
