//! Registration number sequence.

use async_trait::async_trait;

use super::Database;
use crate::sequence::{AllocationError, SequenceSource};

#[async_trait]
impl SequenceSource for Database {
    /// `nextval` is atomic across sessions and never hands out a value twice.
    async fn next_value(&self) -> Result<i64, AllocationError> {
        sqlx::query_scalar::<_, i64>("SELECT nextval('registration_number_seq')")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AllocationError::Unavailable(e.to_string()))
    }
}
