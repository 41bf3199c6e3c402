use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::QuestionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GenerationContextError {
    #[error("batch {requested} is out of order (last completed batch: {last})")]
    OutOfOrder { requested: u32, last: i64 },
}

/// State carried from one generation batch to the next.
///
/// Threaded by value: each batch receives the current context and produces a
/// new one. `last_batch_index` is `-1` before the first batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationContext {
    generated_ids: BTreeSet<QuestionId>,
    last_batch_index: i64,
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl GenerationContext {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            generated_ids: BTreeSet::new(),
            last_batch_index: -1,
        }
    }

    #[must_use]
    pub fn generated_ids(&self) -> &BTreeSet<QuestionId> {
        &self.generated_ids
    }

    #[must_use]
    pub fn last_batch_index(&self) -> i64 {
        self.last_batch_index
    }

    #[must_use]
    pub fn contains(&self, id: &QuestionId) -> bool {
        self.generated_ids.contains(id)
    }

    /// Index of the batch that must be generated next.
    #[must_use]
    pub fn next_batch_index(&self) -> u32 {
        u32::try_from(self.last_batch_index + 1).unwrap_or(0)
    }

    /// Checks that `batch_index` directly follows the last completed batch.
    ///
    /// # Errors
    ///
    /// Returns `GenerationContextError::OutOfOrder` otherwise.
    pub fn ensure_next(&self, batch_index: u32) -> Result<(), GenerationContextError> {
        if i64::from(batch_index) == self.last_batch_index + 1 {
            Ok(())
        } else {
            Err(GenerationContextError::OutOfOrder {
                requested: batch_index,
                last: self.last_batch_index,
            })
        }
    }

    /// Returns the context after `batch_index` completed with `ids`.
    ///
    /// # Errors
    ///
    /// Returns `GenerationContextError::OutOfOrder` if the batch is not the next one.
    pub fn advance<'a>(
        &self,
        batch_index: u32,
        ids: impl IntoIterator<Item = &'a QuestionId>,
    ) -> Result<Self, GenerationContextError> {
        self.ensure_next(batch_index)?;
        let mut generated_ids = self.generated_ids.clone();
        generated_ids.extend(ids.into_iter().cloned());
        Ok(Self {
            generated_ids,
            last_batch_index: i64::from(batch_index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_expects_batch_zero() {
        let ctx = GenerationContext::empty();
        assert_eq!(ctx.last_batch_index(), -1);
        assert_eq!(ctx.next_batch_index(), 0);
        assert!(ctx.ensure_next(0).is_ok());
        assert!(ctx.ensure_next(1).is_err());
    }

    #[test]
    fn advance_is_sequential_and_accumulates_ids() {
        let a = QuestionId::new("a");
        let b = QuestionId::new("b");
        let ctx = GenerationContext::empty().advance(0, [&a]).unwrap();
        let ctx = ctx.advance(1, [&b]).unwrap();

        assert_eq!(ctx.last_batch_index(), 1);
        assert!(ctx.contains(&a) && ctx.contains(&b));

        let err = ctx.advance(3, Vec::<&QuestionId>::new()).unwrap_err();
        assert_eq!(err, GenerationContextError::OutOfOrder { requested: 3, last: 1 });
    }

    #[test]
    fn advance_leaves_the_input_untouched() {
        let ctx = GenerationContext::empty();
        let next = ctx.advance(0, [&QuestionId::new("x")]).unwrap();
        assert_eq!(ctx, GenerationContext::empty());
        assert_ne!(ctx, next);
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let ctx = GenerationContext::empty()
            .advance(0, [&QuestionId::new("x")])
            .unwrap();
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["lastBatchIndex"], 0);
        assert_eq!(json["generatedIds"][0], "x");
    }
}
