//! Helpers that turn per-example tensors into the pre-batched samples a
//! [`Sequential`](crate::nn::sequential::Sequential) model trains on.

use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use rand::seq::SliceRandom;
use rand::Rng;

/// Stacks rank-R samples into rank-(R+1) batches of `batch_size`; the last
/// batch holds the remainder.
pub fn batch<T: Scalar, B: Tensor<T>>(samples: &[B], batch_size: usize) -> Result<Vec<B>> {
    if batch_size == 0 {
        return Err(NetError::invalid("batch_size must be at least 1"));
    }
    samples
        .chunks(batch_size)
        .map(|chunk| {
            let refs: Vec<&B> = chunk.iter().collect();
            B::stack(&refs, 0)
        })
        .collect()
}

/// Shuffles samples and labels with one shared permutation.
pub fn shuffle_together<X, Y, R: Rng + ?Sized>(samples: &mut Vec<X>, labels: &mut Vec<Y>, rng: &mut R) -> Result<()> {
    if samples.len() != labels.len() {
        return Err(NetError::invalid(format!(
            "{} samples but {} labels",
            samples.len(),
            labels.len()
        )));
    }
    let mut order: Vec<usize> = (0..samples.len()).collect();
    order.shuffle(rng);

    let mut taken_samples: Vec<Option<X>> = samples.drain(..).map(Some).collect();
    let mut taken_labels: Vec<Option<Y>> = labels.drain(..).map(Some).collect();
    for &i in &order {
        if let (Some(x), Some(y)) = (taken_samples[i].take(), taken_labels[i].take()) {
            samples.push(x);
            labels.push(y);
        }
    }
    Ok(())
}

/// Splits off the last `test_size` fraction (rounded) as the test set.
///
/// Returns `(train_samples, train_labels, test_samples, test_labels)`.
pub fn train_test_split<X: Clone, Y: Clone>(
    samples: &[X],
    labels: &[Y],
    test_size: f64,
) -> Result<(Vec<X>, Vec<Y>, Vec<X>, Vec<Y>)> {
    if samples.len() != labels.len() {
        return Err(NetError::invalid(format!(
            "{} samples but {} labels",
            samples.len(),
            labels.len()
        )));
    }
    if !(0.0..=1.0).contains(&test_size) {
        return Err(NetError::invalid(format!("test_size must be in [0, 1], got {}", test_size)));
    }
    let test_len = (samples.len() as f64 * test_size).round() as usize;
    let train_len = samples.len() - test_len;

    Ok((
        samples[..train_len].to_vec(),
        labels[..train_len].to_vec(),
        samples[train_len..].to_vec(),
        labels[train_len..].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_batch_with_remainder() {
        let samples: Vec<CpuTensor<f32>> =
            (0..5).map(|i| CpuTensor::new(array![i as f32, 10.0 * i as f32].into_dyn())).collect();
        let batches = batch(&samples, 2).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].shape(), vec![2, 2]);
        assert_eq!(batches[2].shape(), vec![1, 2]);
        assert_eq!(batches[1].get_data()[[1, 1]], 30.0);
        assert!(batch(&samples, 0).is_err());
    }

    #[test]
    fn test_shuffle_keeps_pairs() {
        let mut samples: Vec<usize> = (0..20).collect();
        let mut labels: Vec<usize> = (0..20).map(|i| i * 3).collect();
        shuffle_together(&mut samples, &mut labels, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_ne!(samples, (0..20).collect::<Vec<_>>());
        assert!(samples.iter().zip(&labels).all(|(x, y)| x * 3 == *y));

        let mut short = vec![1];
        assert!(shuffle_together(&mut samples, &mut short, &mut StdRng::seed_from_u64(9)).is_err());
    }

    #[test]
    fn test_split_fraction() {
        let samples: Vec<i32> = (0..10).collect();
        let (train_x, train_y, test_x, test_y) = train_test_split(&samples, &samples, 0.2).unwrap();
        assert_eq!(train_x.len(), 8);
        assert_eq!(test_x, vec![8, 9]);
        assert_eq!(train_y.len() + test_y.len(), 10);
        assert!(train_test_split(&samples, &samples, 1.5).is_err());
    }
}
