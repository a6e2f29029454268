//! Error concealment: the last good output stands in for a failed decode.

use std::sync::Arc;

#[derive(Debug)]
pub struct Concealment<T> {
    last_good: Option<(i64, Arc<T>)>,
}

impl<T> Default for Concealment<T> {
    fn default() -> Self {
        Self { last_good: None }
    }
}

impl<T> Concealment<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful output. Positions behind the last good one are
    /// ignored, so the recorded position never decreases.
    pub fn record(&mut self, position: i64, output: Arc<T>) -> bool {
        match &self.last_good {
            Some((last, _)) if position < *last => false,
            _ => {
                self.last_good = Some((position, output));
                true
            }
        }
    }

    /// Output to substitute for a failed decode
    pub fn conceal(&self) -> Option<Arc<T>> {
        self.last_good.as_ref().map(|(_, output)| output.clone())
    }

    pub fn last_good_position(&self) -> Option<i64> {
        self.last_good.as_ref().map(|(position, _)| *position)
    }
}
