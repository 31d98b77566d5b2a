use std::fmt;

type WeightFn<T> = Box<dyn Fn(&T) -> usize + Send>;

/// Controls when producers on an MPSC channel are asked to produce more.
pub struct BackpressureStrategy<T> {
    kind: Kind<T>,
}

enum Kind<T> {
    Watermark {
        low: usize,
        high: usize,
        current: usize,
        weight: Option<WeightFn<T>>,
    },
    Unbounded,
}

impl<T> BackpressureStrategy<T> {
    /// A watermark strategy counting one unit per element.
    ///
    /// Demand stops once the buffered quantity reaches `high` and returns
    /// once it drains below `low`.
    ///
    /// # Parameters
    /// * `low` - The low watermark.
    /// * `high` - The high watermark.
    ///
    /// # Panics
    /// Panics if `low` exceeds `high`.
    #[inline]
    #[must_use]
    pub fn watermark(low: usize, high: usize) -> Self {
        assert!(low <= high, "low watermark must not exceed high watermark");

        Self {
            kind: Kind::Watermark {
                low,
                high,
                current: 0,
                weight: None,
            },
        }
    }

    /// A watermark strategy weighing each element through `weight`.
    ///
    /// The weight function is called with a shared reference while the
    /// channel still owns the element, once on append and once on removal.
    ///
    /// # Parameters
    /// * `low` - The low watermark.
    /// * `high` - The high watermark.
    /// * `weight` - Computes the quantity an element contributes.
    ///
    /// # Panics
    /// Panics if `low` exceeds `high`.
    #[inline]
    #[must_use]
    pub fn watermark_weighted<F>(low: usize, high: usize, weight: F) -> Self
    where
        F: Fn(&T) -> usize + Send + 'static,
    {
        assert!(low <= high, "low watermark must not exceed high watermark");

        Self {
            kind: Kind::Watermark {
                low,
                high,
                current: 0,
                weight: Some(Box::new(weight)),
            },
        }
    }

    /// A strategy that always signals demand; production must be bounded by
    /// external means.
    #[inline]
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            kind: Kind::Unbounded,
        }
    }

    /// Accounts for newly appended elements.
    ///
    /// # Returns
    /// Whether producers should produce more.
    pub(super) fn did_send<'a>(&mut self, elements: impl Iterator<Item = &'a T>) -> bool
    where
        T: 'a,
    {
        match &mut self.kind {
            | Kind::Watermark {
                high,
                current,
                weight,
                ..
            } => {
                *current += match weight {
                    | Some(weight) => elements.map(|element| weight(element)).sum(),
                    | None => elements.count(),
                };
                *current < *high
            }
            | Kind::Unbounded => true,
        }
    }

    /// Accounts for one element leaving the buffer.
    ///
    /// # Returns
    /// Whether producers should produce more.
    pub(super) fn did_consume(&mut self, element: &T) -> bool {
        match &mut self.kind {
            | Kind::Watermark {
                low,
                current,
                weight,
                ..
            } => {
                let delta = weight.as_ref().map_or(1, |weight| weight(element));
                *current = current.saturating_sub(delta);
                *current < *low
            }
            | Kind::Unbounded => true,
        }
    }
}

impl<T> fmt::Debug for BackpressureStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            | Kind::Watermark {
                low,
                high,
                current,
                weight,
            } => f
                .debug_struct("Watermark")
                .field("low", low)
                .field("high", high)
                .field("current", current)
                .field("weighted", &weight.is_some())
                .finish(),
            | Kind::Unbounded => f.write_str("Unbounded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_stops_demand_at_high() {
        let mut strategy = BackpressureStrategy::watermark(2, 4);

        assert!(strategy.did_send([1, 2, 3].iter()));
        assert!(!strategy.did_send([4].iter()));
    }

    #[test]
    fn watermark_restores_demand_below_low() {
        let mut strategy = BackpressureStrategy::watermark(2, 4);

        strategy.did_send([1, 2, 3, 4].iter());

        assert!(!strategy.did_consume(&1));
        assert!(!strategy.did_consume(&2));
        assert!(strategy.did_consume(&3));
    }

    #[test]
    fn weighted_watermark_sums_weights() {
        let mut strategy =
            BackpressureStrategy::watermark_weighted(2, 8, |element: &Vec<u8>| element.len());

        assert!(strategy.did_send([vec![0; 4]].iter()));
        assert!(!strategy.did_send([vec![0; 4]].iter()));
        assert!(!strategy.did_consume(&vec![0; 4]));
        assert!(strategy.did_consume(&vec![0; 4]));
    }

    #[test]
    fn unbounded_always_signals_demand() {
        let mut strategy = BackpressureStrategy::<u32>::unbounded();

        assert!(strategy.did_send([1, 2, 3].iter()));
        assert!(strategy.did_consume(&1));
    }

    #[test]
    #[should_panic(expected = "low watermark")]
    fn watermark_rejects_inverted_bounds() {
        BackpressureStrategy::<u32>::watermark(5, 2);
    }
}
