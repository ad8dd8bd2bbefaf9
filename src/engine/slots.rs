use crate::model::Minute;

/// Candidate start offsets `from, from + step, ...` strictly below `to`.
///
/// Lazy and finite; `Clone` restarts it from wherever the copy was taken.
#[derive(Debug, Clone)]
pub struct SlotIter {
    next: Minute,
    to: Minute,
    step: Minute,
}

impl Iterator for SlotIter {
    type Item = Minute;

    fn next(&mut self) -> Option<Minute> {
        if self.next >= self.to {
            return None;
        }
        let t = self.next;
        self.next = t.saturating_add(self.step);
        Some(t)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = if self.next >= self.to {
            0
        } else {
            ((self.to - self.next + self.step - 1) / self.step) as usize
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for SlotIter {}

/// Enumerate `[from, to)` at `step`. A non-positive step yields nothing.
pub fn slots(from: Minute, to: Minute, step: Minute) -> SlotIter {
    if step <= 0 {
        return SlotIter { next: to, to, step: 1 };
    }
    SlotIter { next: from, to, step }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_until_exclusive_end() {
        let got: Vec<_> = slots(540, 660, 30).collect();
        assert_eq!(got, vec![540, 570, 600, 630]);
    }

    #[test]
    fn uneven_step_stops_below_end() {
        let got: Vec<_> = slots(0, 25, 10).collect();
        assert_eq!(got, vec![0, 10, 20]);
        assert_eq!(slots(0, 25, 10).len(), 3);
    }

    #[test]
    fn empty_and_degenerate_ranges() {
        assert_eq!(slots(100, 100, 10).count(), 0);
        assert_eq!(slots(200, 100, 10).count(), 0);
        assert_eq!(slots(0, 100, 0).count(), 0);
        assert_eq!(slots(0, 100, -5).count(), 0);
    }

    #[test]
    fn full_day_at_fine_granularity() {
        assert_eq!(slots(0, 24 * 60, 10).count(), 144);
    }

    #[test]
    fn clone_restarts_from_copy_point() {
        let mut it = slots(0, 50, 10);
        it.next();
        let copy = it.clone();
        assert_eq!(it.collect::<Vec<_>>(), copy.collect::<Vec<_>>());
    }
}
