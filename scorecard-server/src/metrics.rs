//! In-process pipeline metrics exposed as `GET /metrics` in Prometheus
//! text format. All counters are `AtomicU64` incremented inline; no
//! external metrics library.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::queue::QueueName;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upper bounds (seconds) of the duration buckets; an implicit +Inf bucket
/// follows.
const BUCKET_BOUNDS: [f64; 8] = [0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKET_BOUNDS.len() + 1],
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        let idx = BUCKET_BOUNDS
            .iter()
            .position(|&bound| secs <= bound)
            .unwrap_or(BUCKET_BOUNDS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render_into(&self, out: &mut String, name: &str, labels: &str) {
        let mut cumulative = 0u64;
        for (i, bound) in BUCKET_BOUNDS.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "{}_bucket{{{}le=\"{}\"}} {}\n",
                name, labels, bound, cumulative
            ));
        }
        cumulative += self.buckets[BUCKET_BOUNDS.len()].load(Ordering::Relaxed);
        out.push_str(&format!(
            "{}_bucket{{{}le=\"+Inf\"}} {}\n",
            name, labels, cumulative
        ));
        out.push_str(&format!(
            "{}_sum{{{}}} {}\n",
            name,
            labels.trim_end_matches(','),
            self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        out.push_str(&format!(
            "{}_count{{{}}} {}\n",
            name,
            labels.trim_end_matches(','),
            self.count.load(Ordering::Relaxed)
        ));
    }
}

#[derive(Debug, Default)]
pub struct StageMetrics {
    pub completed: Counter,
    pub failed: Counter,
    pub dead: Counter,
    pub duration: Histogram,
}

#[derive(Debug)]
pub struct Metrics {
    pub webhooks_received: Counter,
    pub webhooks_rejected: Counter,
    pub events_published: Counter,
    pub review: StageMetrics,
    pub score: StageMetrics,
    pub portfolio: StageMetrics,
    pub notification: StageMetrics,
    pub github_latency: Histogram,
    pub llm_latency: Histogram,
    pub started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            webhooks_received: Counter::default(),
            webhooks_rejected: Counter::default(),
            events_published: Counter::default(),
            review: StageMetrics::default(),
            score: StageMetrics::default(),
            portfolio: StageMetrics::default(),
            notification: StageMetrics::default(),
            github_latency: Histogram::default(),
            llm_latency: Histogram::default(),
            started_at: Instant::now(),
        }
    }

    pub fn stage(&self, queue: QueueName) -> &StageMetrics {
        match queue {
            QueueName::Review => &self.review,
            QueueName::Score => &self.score,
            QueueName::Portfolio => &self.portfolio,
            QueueName::Notification => &self.notification,
        }
    }

    /// Render everything in Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE scorecard_webhooks_received_total counter\n");
        out.push_str(&format!(
            "scorecard_webhooks_received_total {}\n",
            self.webhooks_received.get()
        ));
        out.push_str("# TYPE scorecard_webhooks_rejected_total counter\n");
        out.push_str(&format!(
            "scorecard_webhooks_rejected_total {}\n",
            self.webhooks_rejected.get()
        ));
        out.push_str("# TYPE scorecard_events_published_total counter\n");
        out.push_str(&format!(
            "scorecard_events_published_total {}\n",
            self.events_published.get()
        ));

        out.push_str("# TYPE scorecard_jobs_completed_total counter\n");
        out.push_str("# TYPE scorecard_jobs_failed_total counter\n");
        out.push_str("# TYPE scorecard_jobs_dead_total counter\n");
        for queue in QueueName::all() {
            let stage = self.stage(queue);
            out.push_str(&format!(
                "scorecard_jobs_completed_total{{stage=\"{}\"}} {}\n",
                queue.as_str(),
                stage.completed.get()
            ));
            out.push_str(&format!(
                "scorecard_jobs_failed_total{{stage=\"{}\"}} {}\n",
                queue.as_str(),
                stage.failed.get()
            ));
            out.push_str(&format!(
                "scorecard_jobs_dead_total{{stage=\"{}\"}} {}\n",
                queue.as_str(),
                stage.dead.get()
            ));
        }

        out.push_str("# TYPE scorecard_job_duration_seconds histogram\n");
        for queue in QueueName::all() {
            let labels = format!("stage=\"{}\",", queue.as_str());
            self.stage(queue)
                .duration
                .render_into(&mut out, "scorecard_job_duration_seconds", &labels);
        }

        out.push_str("# TYPE scorecard_external_call_seconds histogram\n");
        self.github_latency
            .render_into(&mut out, "scorecard_external_call_seconds", "target=\"github\",");
        self.llm_latency
            .render_into(&mut out, "scorecard_external_call_seconds", "target=\"llm\",");

        out.push_str("# TYPE scorecard_uptime_seconds gauge\n");
        out.push_str(&format!(
            "scorecard_uptime_seconds {}\n",
            self.started_at.elapsed().as_secs()
        ));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
