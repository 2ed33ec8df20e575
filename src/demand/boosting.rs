// Least-squares gradient boosting over shallow regression trees.
//
// Trees are grown level by level with exact greedy splits. Each feature column is sorted
// once per fit and every tree scans those orders, so a level costs one pass per feature.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        BoostingParams {
            n_estimators: 200,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
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
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    at = if v <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedRegressor {
    pub params: BoostingParams,
    pub n_features: usize,
    base_score: f64,
    trees: Vec<RegressionTree>,
    /// Total squared-error reduction attributed to each feature.
    split_gain: Vec<f64>,
}

/// Column-major copy of the training matrix with per-feature sort orders.
struct Columns {
    values: Vec<Vec<f64>>,
    order: Vec<Vec<usize>>,
}

impl Columns {
    fn new(rows: &[Vec<f64>], n_features: usize) -> Self {
        let values: Vec<Vec<f64>> = (0..n_features)
            .map(|f| rows.iter().map(|r| r.get(f).copied().unwrap_or(0.0)).collect())
            .collect();
        let order = values
            .iter()
            .map(|col| {
                let mut idx: Vec<usize> = (0..col.len()).collect();
                idx.sort_by(|&a, &b| col[a].total_cmp(&col[b]));
                idx
            })
            .collect();
        Columns { values, order }
    }
}

#[derive(Clone, Copy)]
struct Candidate {
    gain: f64,
    feature: usize,
    threshold: f64,
}

impl GradientBoostedRegressor {
    /// Fits on row-major `rows` against `targets`. Deterministic: no subsampling.
    pub fn fit(rows: &[Vec<f64>], targets: &[f64], params: BoostingParams) -> Self {
        let n_features = rows.first().map(Vec::len).unwrap_or(0);
        let n = rows.len().min(targets.len());
        let base_score = if n == 0 {
            0.0
        } else {
            targets[..n].iter().sum::<f64>() / n as f64
        };

        let mut model = GradientBoostedRegressor {
            params,
            n_features,
            base_score,
            trees: Vec::with_capacity(params.n_estimators),
            split_gain: vec![0.0; n_features],
        };
        if n == 0 || n_features == 0 {
            return model;
        }

        let columns = Columns::new(&rows[..n], n_features);
        let mut predictions = vec![base_score; n];
        let mut residuals = vec![0.0; n];

        for _ in 0..params.n_estimators {
            for i in 0..n {
                residuals[i] = targets[i] - predictions[i];
            }
            let tree = model.grow_tree(&columns, &residuals);
            for (i, prediction) in predictions.iter_mut().enumerate() {
                *prediction += params.learning_rate * tree.predict(&rows[i]);
            }
            model.trees.push(tree);
        }
        model
    }

    fn grow_tree(&mut self, columns: &Columns, residuals: &[f64]) -> RegressionTree {
        let n = residuals.len();
        let min_leaf = self.params.min_samples_leaf.max(1);

        // Per-node residual sum and sample count. Node 0 is the root.
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut sums = vec![residuals.iter().sum::<f64>()];
        let mut counts = vec![n];
        let mut node_of = vec![0usize; n];
        let mut frontier = vec![0usize];

        for _ in 0..self.params.max_depth {
            // slot[node] = position of the node in the frontier
            let mut slot = vec![usize::MAX; nodes.len()];
            for (s, &node) in frontier.iter().enumerate() {
                if counts[node] >= 2 * min_leaf {
                    slot[node] = s;
                }
            }
            let mut best: Vec<Option<Candidate>> = vec![None; frontier.len()];

            for feature in 0..self.n_features {
                let col = &columns.values[feature];
                let mut left_sum = vec![0.0; frontier.len()];
                let mut left_count = vec![0usize; frontier.len()];
                let mut last_value = vec![f64::NEG_INFINITY; frontier.len()];

                for &i in &columns.order[feature] {
                    let s = slot[node_of[i]];
                    if s == usize::MAX {
                        continue;
                    }
                    let node = frontier[s];
                    let v = col[i];
                    let nl = left_count[s];
                    let nr = counts[node] - nl;
                    if nl >= min_leaf && nr >= min_leaf && v > last_value[s] {
                        let total = sums[node];
                        let sl = left_sum[s];
                        let sr = total - sl;
                        let gain = sl * sl / nl as f64 + sr * sr / nr as f64
                            - total * total / counts[node] as f64;
                        if best[s].is_none_or(|b| gain > b.gain + 1e-12) {
                            best[s] = Some(Candidate {
                                gain,
                                feature,
                                threshold: (last_value[s] + v) / 2.0,
                            });
                        }
                    }
                    left_sum[s] += residuals[i];
                    left_count[s] += 1;
                    last_value[s] = v;
                }
            }

            let mut next_frontier = Vec::new();
            let mut split_into: Vec<Option<(Candidate, usize, usize)>> = vec![None; nodes.len()];
            for (s, &node) in frontier.iter().enumerate() {
                let Some(candidate) = best[s].filter(|c| c.gain > 1e-12) else {
                    continue;
                };
                let left = nodes.len();
                let right = left + 1;
                nodes.push(Node::Leaf { value: 0.0 });
                nodes.push(Node::Leaf { value: 0.0 });
                sums.extend([0.0, 0.0]);
                counts.extend([0, 0]);
                nodes[node] = Node::Split {
                    feature: candidate.feature,
                    threshold: candidate.threshold,
                    left,
                    right,
                };
                self.split_gain[candidate.feature] += candidate.gain;
                split_into[node] = Some((candidate, left, right));
                next_frontier.extend([left, right]);
            }
            if next_frontier.is_empty() {
                break;
            }

            for i in 0..n {
                if let Some((candidate, left, right)) = split_into.get(node_of[i]).copied().flatten() {
                    let child = if columns.values[candidate.feature][i] <= candidate.threshold {
                        left
                    } else {
                        right
                    };
                    node_of[i] = child;
                    sums[child] += residuals[i];
                    counts[child] += 1;
                }
            }
            frontier = next_frontier;
        }

        for (node, (sum, count)) in nodes.iter_mut().zip(sums.iter().zip(&counts)) {
            if let Node::Leaf { value } = node {
                *value = if *count > 0 { sum / *count as f64 } else { 0.0 };
            }
        }
        RegressionTree { nodes }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base_score
            + self.params.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Split gain per feature normalized to sum to 1. All zeros when no split was made.
    pub fn feature_importances(&self) -> Vec<f64> {
        let total: f64 = self.split_gain.iter().sum();
        if total <= 0.0 {
            return vec![0.0; self.n_features];
        }
        self.split_gain.iter().map(|g| g / total).collect()
    }
}
