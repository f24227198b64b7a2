//! Bagged regression trees (random forest) using rayon
//!
//! Each tree is a CART regressor grown on a bootstrap sample with a
//! variance-reduction split criterion. Tree `i` draws its sample from a
//! ChaCha stream seeded with `seed + i`, and trees are collected in index
//! order, so a forest is bit-identical across runs regardless of how rayon
//! schedules the work.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ForestSettings;
use crate::error::AnalysisError;
use crate::regressor::{check_training_data, normalize, FittedModel, Matrix, Prediction, Regressor};

/// Random forest hyperparameters
#[derive(Debug, Clone)]
pub struct RandomForestRegressor {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for RandomForestRegressor {
    fn default() -> Self {
        Self::from_settings(&ForestSettings::default())
    }
}

impl RandomForestRegressor {
    pub fn from_settings(settings: &ForestSettings) -> Self {
        Self {
            n_trees: settings.n_trees,
            max_depth: settings.max_depth,
            min_samples_split: settings.min_samples_split.max(2),
            min_samples_leaf: settings.min_samples_leaf.max(1),
            seed: settings.seed,
        }
    }

    fn grow_tree(&self, index: usize, x: &Matrix, y: &[f64]) -> RegressionTree {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let n = y.len();
        let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();

        let mut builder = TreeBuilder {
            x,
            y,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            min_samples_leaf: self.min_samples_leaf,
            nodes: Vec::new(),
            importances: vec![0.0; x[0].len()],
        };
        builder.build(sample, 0);

        RegressionTree {
            nodes: builder.nodes,
            importances: normalize(builder.importances),
        }
    }
}

impl Regressor for RandomForestRegressor {
    type Model = RandomForestModel;

    fn fit(&self, x: &Matrix, y: &[f64]) -> Result<RandomForestModel, AnalysisError> {
        let width = check_training_data(self.name(), x, y)?;
        if x.len() < 2 {
            return Err(AnalysisError::insufficient(self.name(), 2, x.len()));
        }

        let trees: Vec<RegressionTree> = (0..self.n_trees.max(1))
            .into_par_iter()
            .map(|i| self.grow_tree(i, x, y))
            .collect();

        let mut importances = vec![0.0; width];
        for tree in &trees {
            for (total, v) in importances.iter_mut().zip(&tree.importances) {
                *total += v;
            }
        }
        let importances = normalize(importances);

        debug!(
            trees = trees.len(),
            rows = x.len(),
            features = width,
            "Random forest fitted"
        );

        Ok(RandomForestModel {
            trees,
            importances,
            n_features: width,
        })
    }

    fn name(&self) -> &'static str {
        "random_forest"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl RegressionTree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

struct TreeBuilder<'a> {
    x: &'a Matrix,
    y: &'a [f64],
    max_depth: usize,
    min_samples_split: usize,
    min_samples_leaf: usize,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl<'a> TreeBuilder<'a> {
    /// Grow the subtree for `sample` and return its node index
    fn build(&mut self, sample: Vec<usize>, depth: usize) -> usize {
        let n = sample.len() as f64;
        let sum: f64 = sample.iter().map(|&i| self.y[i]).sum();
        let sum_sq: f64 = sample.iter().map(|&i| self.y[i] * self.y[i]).sum();
        let mean = sum / n;
        let sse = (sum_sq - sum * sum / n).max(0.0);

        let node_index = self.nodes.len();
        self.nodes.push(Node::Leaf { value: mean });

        if depth >= self.max_depth || sample.len() < self.min_samples_split || sse <= 1e-12 {
            return node_index;
        }

        let Some(best) = self.best_split(&sample, sum, sum_sq) else {
            return node_index;
        };

        let (left_sample, right_sample): (Vec<usize>, Vec<usize>) = sample
            .iter()
            .partition(|&&i| self.x[i][best.feature] <= best.threshold);

        self.importances[best.feature] += best.gain;
        let left = self.build(left_sample, depth + 1);
        let right = self.build(right_sample, depth + 1);
        self.nodes[node_index] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        node_index
    }

    fn best_split(&self, sample: &[usize], sum: f64, sum_sq: f64) -> Option<BestSplit> {
        let n = sample.len();
        let parent_sse = sum_sq - sum * sum / n as f64;
        let mut best: Option<BestSplit> = None;
        let mut order = sample.to_vec();

        for feature in 0..self.x[0].len() {
            order.sort_by(|&a, &b| {
                self.x[a][feature]
                    .total_cmp(&self.x[b][feature])
                    .then(a.cmp(&b))
            });

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for k in 0..n - 1 {
                let yi = self.y[order[k]];
                left_sum += yi;
                left_sq += yi * yi;

                let left_n = k + 1;
                let right_n = n - left_n;
                if left_n < self.min_samples_leaf || right_n < self.min_samples_leaf {
                    continue;
                }
                let here = self.x[order[k]][feature];
                let next = self.x[order[k + 1]][feature];
                if next <= here {
                    continue;
                }

                let right_sum = sum - left_sum;
                let right_sq = sum_sq - left_sq;
                let child_sse = (left_sq - left_sum * left_sum / left_n as f64)
                    + (right_sq - right_sum * right_sum / right_n as f64);
                let gain = parent_sse - child_sse;

                if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(BestSplit {
                        feature,
                        threshold: here + (next - here) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// A fitted forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestModel {
    trees: Vec<RegressionTree>,
    importances: Vec<f64>,
    n_features: usize,
}

impl RandomForestModel {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn max_depth(&self) -> usize {
        self.trees.iter().map(RegressionTree::depth).max().unwrap_or(0)
    }

    /// One prediction per tree
    pub fn tree_predictions(&self, row: &[f64]) -> Vec<f64> {
        self.trees.iter().map(|t| t.predict(row)).collect()
    }
}

impl FittedModel for RandomForestModel {
    fn predict(&self, row: &[f64]) -> f64 {
        let predictions = self.tree_predictions(row);
        predictions.iter().sum::<f64>() / predictions.len().max(1) as f64
    }

    /// Interval from the spread of per-tree predictions
    fn predict_with_interval(&self, row: &[f64], confidence: f64) -> Prediction {
        let mut predictions = self.tree_predictions(row);
        let value = predictions.iter().sum::<f64>() / predictions.len().max(1) as f64;
        predictions.sort_by(f64::total_cmp);

        let tail = ((1.0 - confidence.clamp(0.0, 1.0)) / 2.0) * 100.0;
        Prediction {
            value,
            lower: percentile(&predictions, tail),
            upper: percentile(&predictions, 100.0 - tail),
        }
    }

    fn importances(&self) -> Vec<f64> {
        self.importances.clone()
    }

    fn n_features(&self) -> usize {
        self.n_features
    }
}

/// Linear-interpolated percentile of sorted data
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
