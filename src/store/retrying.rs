use super::MeasurementStore;
use crate::error::StoreError;
use crate::measurement::{NewPrediction, ProcessingContext, RawFragmentRow};
use crate::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Wraps every call of an inner store in the retry policy, bounding each
/// attempt by `call_timeout`.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl<S: MeasurementStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            call_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &S {
        &self.inner
    }

    async fn call<'a, T, F, Fut>(
        &'a self,
        operation: &'static str,
        mut f: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(&'a S) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.call_timeout;
        let inner = &self.inner;
        with_retry(&self.policy, operation, || {
            let attempt = f(inner);
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout {
                        operation,
                        after: timeout,
                    }),
                }
            }
        })
        .await
    }
}

#[async_trait]
impl<S: MeasurementStore> MeasurementStore for RetryingStore<S> {
    async fn last_prediction(&self) -> Result<Option<ProcessingContext>, StoreError> {
        self.call("last_prediction", |s| s.last_prediction()).await
    }

    async fn unprocessed_measurements(&self) -> Result<Vec<RawFragmentRow>, StoreError> {
        self.call("unprocessed_measurements", |s| s.unprocessed_measurements())
            .await
    }

    async fn last_measurement_before(
        &self,
        sensor_id: i64,
        device_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawFragmentRow>, StoreError> {
        self.call("last_measurement_before", |s| {
            s.last_measurement_before(sensor_id, device_id, before)
        })
        .await
    }

    async fn insert_prediction(&self, prediction: &NewPrediction) -> Result<(), StoreError> {
        self.call("insert_prediction", |s| s.insert_prediction(prediction))
            .await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
