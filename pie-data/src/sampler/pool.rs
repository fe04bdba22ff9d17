use crate::common::*;

/// A reshuffling pool of items drawn without replacement.
///
/// Once every item has been drawn, the pool is shuffled again and a new
/// epoch starts.
#[derive(Debug, Clone)]
pub struct IndexPool {
    items: Vec<usize>,
    cursor: usize,
}

impl IndexPool {
    pub fn new(items: Vec<usize>) -> Self {
        let cursor = items.len();
        Self { items, cursor }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[usize] {
        &self.items
    }

    /// Draws the next item that is not in `exclude`.
    ///
    /// Excluded items that are passed over stay in the current epoch. It
    /// returns `None` when every item of the pool is excluded.
    pub fn draw_excluding<R>(&mut self, exclude: &[usize], rng: &mut R) -> Option<usize>
    where
        R: Rng + ?Sized,
    {
        if self.items.iter().all(|item| exclude.contains(item)) {
            return None;
        }

        loop {
            if self.cursor >= self.items.len() {
                self.items.shuffle(rng);
                self.cursor = 0;
            }

            let found = (self.cursor..self.items.len())
                .find(|&pos| !exclude.contains(&self.items[pos]));

            match found {
                Some(pos) => {
                    self.items.swap(self.cursor, pos);
                    let item = self.items[self.cursor];
                    self.cursor += 1;
                    return Some(item);
                }
                None => {
                    // the rest of this epoch is excluded, start a new one
                    self.cursor = self.items.len();
                }
            }
        }
    }

    /// Draws up to `count` distinct items.
    pub fn draw_distinct<R>(&mut self, count: usize, rng: &mut R) -> Vec<usize>
    where
        R: Rng + ?Sized,
    {
        let mut drawn = Vec::with_capacity(count);
        while drawn.len() < count {
            match self.draw_excluding(&drawn, rng) {
                Some(item) => drawn.push(item),
                None => break,
            }
        }
        drawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_visits_every_item_once() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pool = IndexPool::new((0..10).collect());
        let mut drawn: Vec<_> = (0..10)
            .map(|_| pool.draw_excluding(&[], &mut rng).unwrap())
            .collect();
        drawn.sort_unstable();
        assert_eq!(drawn, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn distinct_draw_across_epoch_boundary() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut pool = IndexPool::new((0..5).collect());
        for _ in 0..50 {
            let drawn = pool.draw_distinct(3, &mut rng);
            assert_eq!(drawn.len(), 3);
            assert_eq!(drawn.iter().unique().count(), 3);
        }
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pool = IndexPool::new(vec![4, 7]);
        assert_eq!(pool.draw_excluding(&[4, 7], &mut rng), None);
        assert_eq!(pool.draw_distinct(5, &mut rng).len(), 2);
    }
}
