//! Ranking of gallery identities by embedding distance.

use crate::common::*;

/// The metric between two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    L2,
    /// One minus the cosine similarity.
    Cosine,
}

impl Default for Distance {
    fn default() -> Self {
        Self::L2
    }
}

impl From<DistanceKind> for Distance {
    fn from(kind: DistanceKind) -> Self {
        match kind {
            DistanceKind::L2 => Self::L2,
            DistanceKind::Cosine => Self::Cosine,
        }
    }
}

impl FromStr for Distance {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let distance = match text {
            "l2" | "euclidean" => Self::L2,
            "cosine" => Self::Cosine,
            _ => return Err(PieError::config(format!("unknown distance '{}'", text)).into()),
        };
        Ok(distance)
    }
}

impl Distance {
    pub fn compute(&self, lhs: ArrayView1<f32>, rhs: ArrayView1<f32>) -> f32 {
        match self {
            Self::L2 => lhs
                .iter()
                .zip(rhs.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
            Self::Cosine => {
                let dot = lhs.dot(&rhs);
                let norm = lhs.dot(&lhs).sqrt() * rhs.dot(&rhs).sqrt();
                if norm > 0.0 {
                    1.0 - dot / norm
                } else {
                    1.0
                }
            }
        }
    }

    /// Distances from the query to every row of the gallery.
    pub fn to_rows(&self, query: ArrayView1<f32>, gallery: ArrayView2<f32>) -> Vec<f32> {
        gallery
            .outer_iter()
            .map(|row| self.compute(query, row))
            .collect()
    }
}

/// One ranked identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub label: String,
    /// The smallest distance between the query and an embedding of the label.
    pub distance: f64,
}

/// Ranks distinct labels by their smallest distance, ascending. Ties are
/// broken by gallery order.
pub fn rank_labels<'a, L>(distances: &[f32], labels: &'a [L]) -> Vec<(&'a L, f32)>
where
    L: Eq + std::hash::Hash,
{
    let mut best: IndexMap<&L, f32> = IndexMap::new();
    for (label, &distance) in labels.iter().zip(distances) {
        best.entry(label)
            .and_modify(|prev| {
                if distance < *prev {
                    *prev = distance;
                }
            })
            .or_insert(distance);
    }

    let mut ranked: Vec<_> = best.into_iter().collect();
    ranked.sort_by(|(_, lhs), (_, rhs)| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal));
    ranked
}

/// Returns the `k` best distinct gallery labels for the query.
pub fn predict_light(
    query: ArrayView1<f32>,
    gallery: ArrayView2<f32>,
    labels: &[String],
    k: usize,
    distance: Distance,
) -> Result<Vec<Answer>> {
    if gallery.nrows() != labels.len() {
        return Err(PieError::data(format!(
            "the gallery has {} embeddings, but {} labels",
            gallery.nrows(),
            labels.len()
        ))
        .into());
    }
    if gallery.ncols() != query.len() {
        return Err(PieError::data(format!(
            "query embedding has size {}, but the gallery has size {}",
            query.len(),
            gallery.ncols()
        ))
        .into());
    }

    let distances = distance.to_rows(query, gallery);
    let answers = rank_labels(&distances, labels)
        .into_iter()
        .take(k)
        .map(|(label, distance)| Answer {
            label: label.clone(),
            distance: distance as f64,
        })
        .collect();
    Ok(answers)
}

/// Checks two rankings for agreement.
///
/// It fails at the first rank where the labels differ, or at the rank of the
/// largest distance gap when it reaches the tolerance.
pub fn compare_answers(lhs: &[Answer], rhs: &[Answer], tolerance: f64) -> Result<()> {
    ensure!(
        lhs.len() == rhs.len(),
        "rankings have different lengths {} and {}",
        lhs.len(),
        rhs.len()
    );

    if let Some(rank) = lhs
        .iter()
        .zip(rhs)
        .position(|(lhs, rhs)| lhs.label != rhs.label)
    {
        bail!("label rankings differ at rank {}", rank);
    }
    debug!("labels agree");

    let max_gap = lhs
        .iter()
        .zip(rhs)
        .map(|(lhs, rhs)| (lhs.distance - rhs.distance).abs())
        .enumerate()
        .max_by(|(_, lhs), (_, rhs)| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal));
    if let Some((rank, gap)) = max_gap {
        if gap.is_nan() || gap >= tolerance {
            bail!("distances diverge at rank {} by {}", rank, gap);
        }
    }
    debug!("distances are all within tolerance of {}", tolerance);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn distances() {
        let lhs = array![3.0f32, 0.0];
        let rhs = array![0.0f32, 4.0];
        assert_abs_diff_eq!(Distance::L2.compute(lhs.view(), rhs.view()), 5.0);
        assert_abs_diff_eq!(Distance::Cosine.compute(lhs.view(), rhs.view()), 1.0);
        assert_abs_diff_eq!(Distance::Cosine.compute(lhs.view(), lhs.view()), 0.0);
        assert_eq!("cosine".parse::<Distance>().unwrap(), Distance::Cosine);
        assert!("manhattan".parse::<Distance>().is_err());
    }

    #[test]
    fn predict_keeps_the_best_of_each_label() {
        let gallery = array![[0.0f32, 0.0], [1.0, 0.0], [5.0, 0.0], [0.5, 0.0], [9.0, 0.0]];
        let names = labels(&["a", "b", "a", "c", "d"]);
        let query = array![0.6f32, 0.0];

        let answers = predict_light(query.view(), gallery.view(), &names, 3, Distance::L2).unwrap();
        let ranked: Vec<_> = answers.iter().map(|answer| answer.label.as_str()).collect();
        assert_eq!(ranked, vec!["c", "b", "a"]);
        assert_abs_diff_eq!(answers[0].distance, 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(answers[2].distance, 0.6, epsilon = 1e-6);

        // k larger than the label count
        let answers = predict_light(query.view(), gallery.view(), &names, 10, Distance::L2).unwrap();
        assert_eq!(answers.len(), 4);
    }

    #[test]
    fn predict_rejects_mismatched_inputs() {
        let gallery = array![[0.0f32, 0.0], [1.0, 0.0]];
        let query = array![0.0f32, 0.0, 0.0];
        assert!(predict_light(query.view(), gallery.view(), &labels(&["a", "b"]), 1, Distance::L2).is_err());
        let query = array![0.0f32, 0.0];
        assert!(predict_light(query.view(), gallery.view(), &labels(&["a"]), 1, Distance::L2).is_err());
    }

    #[test]
    fn compare() {
        let answer = |label: &str, distance: f64| Answer {
            label: label.to_owned(),
            distance,
        };
        let lhs = vec![answer("a", 0.1), answer("b", 0.2)];
        let close = vec![answer("a", 0.1 + 2e-8), answer("b", 0.2)];
        let far = vec![answer("a", 0.1), answer("b", 0.3)];
        let swapped = vec![answer("b", 0.1), answer("a", 0.2)];

        assert!(compare_answers(&lhs, &close, 1e-5).is_ok());

        let err = compare_answers(&lhs, &far, 1e-5).unwrap_err();
        assert!(err.to_string().contains("rank 1"));

        let err = compare_answers(&lhs, &swapped, 1e-5).unwrap_err();
        assert!(err.to_string().contains("rank 0"));
    }
}
