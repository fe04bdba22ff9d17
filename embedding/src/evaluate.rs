//! One-vs-all accuracy-at-k evaluation on held-out identities.

use crate::{common::*, rank::Distance, rank::rank_labels};

/// Accuracy at one `k`, in percent over the evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyAtK {
    pub k: usize,
    pub mean: f64,
    pub std: f64,
}

/// Options of [evaluate_one_vs_all].
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationInit {
    /// Number of random gallery/query draws averaged.
    pub n_eval_runs: usize,
    /// Images of each validation class moved into the gallery.
    pub move_to_db: usize,
    pub k_list: Vec<usize>,
    pub distance: Distance,
    pub seed: Option<u64>,
}

/// Evaluates validation embeddings against the training gallery.
///
/// In each run, every validation class with more than `move_to_db` images
/// moves `move_to_db` random images into a gallery that also holds all
/// training embeddings. The remaining images of the class are queries. A query
/// is correct at `k` when its class is among the `k` nearest distinct gallery
/// classes.
pub fn evaluate_one_vs_all(
    train_emb: ArrayView2<f32>,
    train_cls: &[usize],
    valid_emb: ArrayView2<f32>,
    valid_cls: &[usize],
    init: &EvaluationInit,
) -> Result<Vec<AccuracyAtK>> {
    let EvaluationInit {
        n_eval_runs,
        move_to_db,
        ref k_list,
        distance,
        seed,
    } = *init;

    ensure!(n_eval_runs > 0, "n_eval_runs must be positive");
    ensure!(
        !k_list.is_empty() && !k_list.contains(&0),
        "k_list must hold positive values"
    );
    ensure!(
        train_emb.nrows() == train_cls.len() && valid_emb.nrows() == valid_cls.len(),
        "embeddings and classes are not aligned"
    );
    ensure!(
        train_emb.ncols() == valid_emb.ncols(),
        "train and validation embeddings differ in size"
    );

    let valid_groups: BTreeMap<usize, Vec<usize>> = valid_cls
        .iter()
        .enumerate()
        .map(|(index, &class)| (class, index))
        .into_group_map()
        .into_iter()
        .collect();

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut accuracies: Vec<Vec<f64>> = vec![vec![]; k_list.len()];

    for run in 0..n_eval_runs {
        let mut gallery_rows: Vec<ArrayView1<f32>> = train_emb.outer_iter().collect();
        let mut gallery_cls: Vec<usize> = train_cls.to_vec();
        let mut queries: Vec<usize> = vec![];

        for (&class, indexes) in &valid_groups {
            if indexes.len() <= move_to_db {
                continue;
            }
            let mut indexes = indexes.clone();
            indexes.shuffle(&mut rng);
            let (moved, rest) = indexes.split_at(move_to_db);
            for &index in moved {
                gallery_rows.push(valid_emb.row(index));
                gallery_cls.push(class);
            }
            queries.extend_from_slice(rest);
        }

        if queries.is_empty() {
            return Err(PieError::data(format!(
                "no validation class has more than {} images to query",
                move_to_db
            ))
            .into());
        }
        if gallery_rows.is_empty() {
            return Err(PieError::data("the gallery is empty").into());
        }

        let mut hits = vec![0usize; k_list.len()];
        for &query in &queries {
            let query_row = valid_emb.row(query);
            let distances: Vec<f32> = gallery_rows
                .iter()
                .map(|row| distance.compute(query_row, *row))
                .collect();
            let ranked = rank_labels(&distances, &gallery_cls);
            let position = ranked
                .iter()
                .position(|(class, _)| **class == valid_cls[query]);

            if let Some(position) = position {
                for (hit, &k) in hits.iter_mut().zip(k_list) {
                    if position < k {
                        *hit += 1;
                    }
                }
            }
        }

        for (accuracy, hit) in accuracies.iter_mut().zip(hits) {
            accuracy.push(hit as f64 / queries.len() as f64 * 100.0);
        }
        debug!("evaluation run {} used {} queries", run, queries.len());
    }

    let results = k_list
        .iter()
        .zip(accuracies)
        .map(|(&k, values)| {
            let (mean, std) = mean_std(&values);
            AccuracyAtK { k, mean, std }
        })
        .collect();
    Ok(results)
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let len = values.len() as f64;
    let mean = values.iter().sum::<f64>() / len;
    let var = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / len;
    (mean, var.sqrt())
}
