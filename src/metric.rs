use std::marker::PhantomData;

use burn::{
    tensor::{backend::Backend, Tensor},
    train::metric::{
        state::{FormatOptions, NumericMetricState},
        Metric, MetricEntry, MetricMetadata, Numeric,
    },
};

use crate::{
    error::{ChartError, Result},
    utils::{benetech::benetech_score, text_processor::TextProcessor},
};

/// Running mean of the Benetech score over every sample seen since the last
/// reset.
#[derive(Debug, Clone, Default)]
pub struct BenetechMetric {
    total: f64,
    count: usize,
}

impl BenetechMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, ground_truths: &[String], predictions: &[String]) -> Result<()> {
        if ground_truths.len() != predictions.len() {
            return Err(ChartError::LengthMismatch {
                ground_truths: ground_truths.len(),
                predictions: predictions.len(),
            });
        }

        for (truth, pred) in ground_truths.iter().zip(predictions) {
            self.total += benetech_score(truth, pred);
        }
        self.count += ground_truths.len();

        Ok(())
    }

    pub fn compute(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        self.total / self.count as f64
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Folds the samples of `other` into this accumulator.
    pub fn merge(&mut self, other: &BenetechMetric) {
        self.total += other.total;
        self.count += other.count;
    }

    pub fn reset(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }
}

/// Generated token ids of a validation batch with the texts they should
/// reproduce.
#[derive(Debug, Clone)]
pub struct BenetechInput {
    pub ground_truths: Vec<String>,
    pub predicted_ids: Vec<Vec<u32>>,
}

/// Logs the Benetech score as `benetech_score`, weighted by batch size. The
/// epoch score is reset whenever the learner clears its metrics at the end of
/// an epoch.
pub struct BenetechScoreMetric {
    processor: TextProcessor,
    epoch: BenetechMetric,
    state: NumericMetricState,
}

impl BenetechScoreMetric {
    pub fn new(processor: TextProcessor) -> Self {
        Self {
            processor,
            epoch: BenetechMetric::new(),
            state: NumericMetricState::new(),
        }
    }

    /// Decodes the generated ids, scores them against the ground truths and
    /// returns the mean score of the batch.
    pub fn score_batch(&mut self, item: &BenetechInput) -> f64 {
        let predictions: Vec<String> = item
            .predicted_ids
            .iter()
            .map(|ids| {
                self.processor.decode(ids).unwrap_or_else(|err| {
                    tracing::warn!("failed to decode generated ids: {err}");
                    String::new()
                })
            })
            .collect();

        let mut batch = BenetechMetric::new();
        if let Err(err) = batch.update(&item.ground_truths, &predictions) {
            tracing::warn!("skipping benetech update: {err}");
        }
        self.epoch.merge(&batch);

        batch.compute()
    }
}

impl Metric for BenetechScoreMetric {
    const NAME: &'static str = "benetech_score";

    type Input = BenetechInput;

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        let score = self.score_batch(item);

        self.state.update(
            score,
            item.ground_truths.len(),
            FormatOptions::new(Self::NAME).precision(4),
        )
    }

    fn clear(&mut self) {
        self.epoch.reset();
        self.state.reset();
    }
}

impl Numeric for BenetechScoreMetric {
    fn value(&self) -> f64 {
        self.epoch.compute()
    }
}

/// Loss of one step together with the number of samples it covers.
#[derive(Debug, Clone)]
pub struct ChartLossInput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub batch_size: usize,
}

/// Loss weighted by batch size. Logged under the train and valid splits.
pub struct ChartLossMetric<B: Backend> {
    state: NumericMetricState,
    _b: PhantomData<B>,
}

impl<B: Backend> ChartLossMetric<B> {
    pub fn new() -> Self {
        Self {
            state: NumericMetricState::new(),
            _b: PhantomData,
        }
    }
}

impl<B: Backend> Default for ChartLossMetric<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Metric for ChartLossMetric<B> {
    const NAME: &'static str = "loss";

    type Input = ChartLossInput<B>;

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        let loss = item.loss.clone().mean().into_data().convert::<f64>().value[0];

        self.state.update(
            loss,
            item.batch_size,
            FormatOptions::new(Self::NAME).precision(4),
        )
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl<B: Backend> Numeric for ChartLossMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}
