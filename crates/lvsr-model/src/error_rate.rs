//! Phoneme error rate.

/// Расстояние Левенштейна между последовательностями.
pub fn edit_distance<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> usize {
    let mut previous: Vec<usize> = (0..=hypothesis.len()).collect();
    let mut current = vec![0; hypothesis.len() + 1];
    for (i, r) in reference.iter().enumerate() {
        current[0] = i + 1;
        for (j, h) in hypothesis.iter().enumerate() {
            let substitution = previous[j] + usize::from(r != h);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[hypothesis.len()]
}

/// `min(1, edit_distance / len(reference))`. Пустой эталон даёт 0 или 1.
pub fn phoneme_error_rate<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> f64 {
    if reference.is_empty() {
        return if hypothesis.is_empty() { 0.0 } else { 1.0 };
    }
    (edit_distance(reference, hypothesis) as f64 / reference.len() as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 2, 3]), 0);
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 3]), 1);
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 4, 3, 5]), 2);
        assert_eq!(edit_distance::<u32>(&[], &[1, 2]), 2);
        assert_eq!(edit_distance(&["k", "ae", "t"], &["ae", "t", "s"]), 2);
    }

    #[test]
    fn test_per_is_capped() {
        assert_eq!(phoneme_error_rate(&[1, 2], &[3, 4, 5, 6]), 1.0);
        assert!((phoneme_error_rate(&[1, 2, 3, 4], &[1, 2, 3]) - 0.25).abs() < 1e-12);
        assert_eq!(phoneme_error_rate::<u32>(&[], &[]), 0.0);
    }
}
