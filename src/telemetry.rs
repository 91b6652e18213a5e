use axum_prometheus::{
    metrics,
    metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle},
    utils::SECONDS_DURATION_BUCKETS,
    AXUM_HTTP_REQUESTS_DURATION_SECONDS,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::{collections::HashSet, sync::OnceLock};

static HTTP_METRICS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Handle of the process-wide recorder fed by the HTTP metrics layer.
fn http_metrics_handle() -> PrometheusHandle {
    HTTP_METRICS
        .get_or_init(|| {
            let builder = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Full(AXUM_HTTP_REQUESTS_DURATION_SECONDS.to_string()),
                    SECONDS_DURATION_BUCKETS,
                )
                .unwrap_or_else(|e| {
                    tracing::warn!("Falling back to default HTTP latency buckets: {}", e);
                    PrometheusBuilder::new()
                });
            let recorder = builder.build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                tracing::warn!("A global metrics recorder is already installed");
            }
            handle
        })
        .clone()
}

pub struct Metrics {
    inference_duration: HistogramVec,
    prediction_counter: IntCounterVec,
    registry: Registry,
    http: PrometheusHandle,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let boundaries = generate_boundaries((5, 25, 50, 250, 1000));
        let inference_duration = HistogramVec::new(
            HistogramOpts::new(
                "inference_duration_ms",
                "Duration of preprocessing and inference in milliseconds",
            )
            .buckets(boundaries),
            &["route"],
        )?;

        let prediction_counter = IntCounterVec::new(
            Opts::new("predictions_total", "Top predictions served, by class"),
            &["class"],
        )?;

        registry.register(Box::new(inference_duration.clone()))?;
        registry.register(Box::new(prediction_counter.clone()))?;

        Ok(Metrics {
            inference_duration,
            prediction_counter,
            registry,
            http: http_metrics_handle(),
        })
    }

    pub fn record_inference_duration(&self, duration_ms: f64, route: &str) {
        self.inference_duration
            .with_label_values(&[route])
            .observe(duration_ms);
    }

    pub fn record_prediction(&self, class_label: &str) {
        self.prediction_counter
            .with_label_values(&[class_label])
            .inc();
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        let mut text =
            String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))?;

        self.http.run_upkeep();
        text.push_str(&self.http.render());
        Ok(text)
    }
}

/// Bucket edges: fine steps for fast passes, coarser ones for slow outliers.
fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 5;
    let middle_step: usize = 10;
    let end_step: usize = 50;
    let tail_step: usize = 250;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
